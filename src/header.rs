//! Volume header codec for the three on-disk formats.
//!
//! A header occupies the volume's first sector: a 4-byte magic, then tagged
//! packets, each a big-endian 16-bit id followed by a 16-bit length (payload
//! length plus the two length bytes) and the payload, terminated by an id of 0.
//! Packet ids must be strictly ascending and unrecognized ids are fatal; this
//! format predates forward-compatible skipping.
//!
//! Packet 1 carries volume metadata, packet 2 the encryption parameters and the
//! encrypted master key, packet 3 (SFS1 only) a boot-sector-equivalent
//! filesystem description that is itself encrypted with the keystream left over
//! from the master-key decryption.

use byteorder::{BigEndian, ByteOrder};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::blowfish::key_init_extended;
use crate::crypto::{CipherId, FormatTwoCipher, BLOCK_LEN};
use crate::entropy::EntropySource;
use crate::error::VolumeError;
use crate::kdf::{self, Prf, SALT_LEN};
use crate::mdc::{MdcCfb, MDC_BLOCK_LEN, MDC_KEY_LEN};
use crate::sector::SectorEngine;
use crate::volume::CryptoInfo;

pub const HEADER_SIZE: usize = 512;
/// Master-key size of the legacy and SFS1 formats.
pub const SFS_DISKKEY_SIZE: usize = 64;
/// Master-key size of the E4M2 format.
pub const E4M_DISKKEY_SIZE: usize = 32;

const PACKET_VOLUME_INFO: u16 = 1;
const PACKET_ENCRYPTION_INFO: u16 = 2;
const PACKET_FILESYSTEM_INFO: u16 = 3;

const VOLUME_INFO_LEN: usize = 28;
const FILESYSTEM_INFO_LEN: usize = 32;
// cipher(2) iterations(2) salt(20), then the per-format tail.
const LEGACY_ENCRYPTION_INFO_LEN: usize = 24 + SFS_DISKKEY_SIZE + 2;
const SFS_ENCRYPTION_INFO_LEN: usize = 24 + MDC_BLOCK_LEN + SFS_DISKKEY_SIZE + 2;
const V2_ENCRYPTION_INFO_LEN: usize = 24 + BLOCK_LEN + E4M_DISKKEY_SIZE + 2 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    Legacy,
    Sfs,
    V2,
}

impl HeaderFormat {
    pub fn magic(self) -> [u8; 4] {
        match self {
            HeaderFormat::Legacy => *b"CAV ",
            HeaderFormat::Sfs => *b"SFS1",
            HeaderFormat::V2 => *b"E4M2",
        }
    }
}

/// Classify a header by its 4-byte magic. Anything else, including a buffer too
/// short to hold a magic, is simply not one of our volumes.
pub fn recognize(header: &[u8]) -> Result<HeaderFormat, VolumeError> {
    if header.len() < 4 {
        return Err(VolumeError::NotAVolume);
    }
    match &header[..4] {
        b"CAV " => Ok(HeaderFormat::Legacy),
        b"SFS1" => Ok(HeaderFormat::Sfs),
        b"E4M2" => Ok(HeaderFormat::V2),
        _ => Err(VolumeError::NotAVolume),
    }
}

/// Volume metadata from packet 1: label, creation time, serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub label: [u8; 16],
    pub created: u64,
    pub serial: u32,
}

impl VolumeInfo {
    fn decode(payload: &[u8]) -> Result<VolumeInfo, VolumeError> {
        if payload.len() != VOLUME_INFO_LEN {
            return Err(VolumeError::BadFormat);
        }
        let mut label = [0u8; 16];
        label.copy_from_slice(&payload[..16]);
        Ok(VolumeInfo {
            label,
            created: BigEndian::read_u64(&payload[16..24]),
            serial: BigEndian::read_u32(&payload[24..28]),
        })
    }

    fn encode(&self) -> [u8; VOLUME_INFO_LEN] {
        let mut out = [0u8; VOLUME_INFO_LEN];
        out[..16].copy_from_slice(&self.label);
        BigEndian::write_u64(&mut out[16..24], self.created);
        BigEndian::write_u32(&mut out[24..28], self.serial);
        out
    }
}

/// Boot-sector-equivalent filesystem description from the SFS1 packet 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemInfo {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub media: u8,
    pub total_sectors: u32,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub label: [u8; 11],
}

impl FilesystemInfo {
    fn decode(payload: &[u8; FILESYSTEM_INFO_LEN]) -> FilesystemInfo {
        let mut label = [0u8; 11];
        label.copy_from_slice(&payload[11..22]);
        FilesystemInfo {
            bytes_per_sector: BigEndian::read_u16(&payload[0..2]),
            sectors_per_cluster: payload[2],
            media: payload[3],
            total_sectors: BigEndian::read_u32(&payload[4..8]),
            reserved_sectors: BigEndian::read_u16(&payload[8..10]),
            fat_count: payload[10],
            label,
        }
    }

    fn encode(&self) -> [u8; FILESYSTEM_INFO_LEN] {
        let mut out = [0u8; FILESYSTEM_INFO_LEN];
        BigEndian::write_u16(&mut out[0..2], self.bytes_per_sector);
        out[2] = self.sectors_per_cluster;
        out[3] = self.media;
        BigEndian::write_u32(&mut out[4..8], self.total_sectors);
        BigEndian::write_u16(&mut out[8..10], self.reserved_sectors);
        out[10] = self.fat_count;
        out[11..22].copy_from_slice(&self.label);
        out
    }
}

/// Everything `read` recovers from a header with the right password.
pub struct ParsedHeader {
    pub crypto: CryptoInfo,
    pub volume: VolumeInfo,
    pub filesystem: Option<FilesystemInfo>,
}

/// Parameters for writing a fresh volume header. `prf` applies to the V2 format
/// only; `filesystem` is legal only for Sfs.
pub struct WriteParams {
    pub format: HeaderFormat,
    pub cipher: CipherId,
    pub iterations: u16,
    pub prf: Prf,
    pub label: [u8; 16],
    pub created: u64,
    pub serial: u32,
    pub filesystem: Option<FilesystemInfo>,
}

struct Packet<'a> {
    id: u16,
    /// Absolute byte offset of the payload within the header.
    offset: usize,
    payload: &'a [u8],
}

struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        PacketReader { buf, pos }
    }

    fn take_u16(&mut self) -> Result<u16, VolumeError> {
        if self.buf.len() - self.pos < 2 {
            return Err(VolumeError::BadFormat);
        }
        let v = BigEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(v)
    }

    fn next(&mut self) -> Result<Option<Packet<'a>>, VolumeError> {
        let id = self.take_u16()?;
        if id == 0 {
            return Ok(None);
        }
        let length = usize::from(self.take_u16()?);
        // The stored length counts its own two bytes.
        let payload_len = length.checked_sub(2).ok_or(VolumeError::BadFormat)?;
        if self.buf.len() - self.pos < payload_len {
            return Err(VolumeError::BadFormat);
        }
        let offset = self.pos;
        let payload = &self.buf[self.pos..self.pos + payload_len];
        self.pos += payload_len;
        Ok(Some(Packet { id, offset, payload }))
    }
}

/// Parse a header and unlock it with `password`.
///
/// Structural problems are `BadFormat`; a key-check mismatch after an otherwise
/// well-formed parse is `WrongPassword` and the caller may retry.
pub fn read(header: &[u8], password: &[u8]) -> Result<ParsedHeader, VolumeError> {
    let format = recognize(header)?;
    log::debug!("reading {:?} volume header", format);

    let mut packets = PacketReader::new(header, 4);
    let mut volume = None;
    let mut crypto = None;
    let mut trailing_stream: Option<MdcCfb> = None;
    let mut filesystem = None;
    let mut last_id = 0u16;

    while let Some(packet) = packets.next()? {
        // Ids must strictly ascend; a duplicate or out-of-order packet is corrupt.
        if packet.id <= last_id {
            return Err(VolumeError::BadFormat);
        }
        last_id = packet.id;
        match packet.id {
            PACKET_VOLUME_INFO => volume = Some(VolumeInfo::decode(packet.payload)?),
            PACKET_ENCRYPTION_INFO => {
                let (info, stream) =
                    recover_keys(format, packet.payload, packet.offset, password)?;
                crypto = Some(info);
                trailing_stream = stream;
            }
            PACKET_FILESYSTEM_INFO if format == HeaderFormat::Sfs => {
                if packet.payload.len() != FILESYSTEM_INFO_LEN {
                    return Err(VolumeError::BadFormat);
                }
                let mut buf = [0u8; FILESYSTEM_INFO_LEN];
                buf.copy_from_slice(packet.payload);
                if let Some(stream) = trailing_stream.as_mut() {
                    stream.decrypt(&mut buf);
                }
                filesystem = Some(FilesystemInfo::decode(&buf));
                buf.zeroize();
            }
            _ => return Err(VolumeError::BadFormat),
        }
    }

    match (crypto, volume) {
        (Some(crypto), Some(volume)) => Ok(ParsedHeader {
            crypto,
            volume,
            filesystem,
        }),
        _ => Err(VolumeError::BadFormat),
    }
}

/// Decode packet 2 for `format`, derive the user key, verify the key-check word
/// and decrypt the master key. For Sfs the live CFB state is handed back so a
/// following filesystem packet can continue the keystream.
fn recover_keys(
    format: HeaderFormat,
    payload: &[u8],
    payload_offset: usize,
    password: &[u8],
) -> Result<(CryptoInfo, Option<MdcCfb>), VolumeError> {
    let expected_len = match format {
        HeaderFormat::Legacy => LEGACY_ENCRYPTION_INFO_LEN,
        HeaderFormat::Sfs => SFS_ENCRYPTION_INFO_LEN,
        HeaderFormat::V2 => V2_ENCRYPTION_INFO_LEN,
    };
    if payload.len() != expected_len {
        return Err(VolumeError::BadFormat);
    }

    // Common prefix: cipher id, iteration count, 20-byte salt.
    let cipher = CipherId::from_wire(BigEndian::read_u16(&payload[0..2]))
        .ok_or(VolumeError::BadFormat)?;
    if !cipher.is_legal_for(format) {
        return Err(VolumeError::BadFormat);
    }
    let iterations = u32::from(BigEndian::read_u16(&payload[2..4]));
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&payload[4..24]);

    match format {
        HeaderFormat::Legacy => {
            // No separate IV field: the salt doubles as the sector IV and its
            // first 8 bytes seed the stretch CFB.
            let mut iv8 = [0u8; 8];
            iv8.copy_from_slice(&salt[..8]);
            let mut key = key_init_extended(password, iterations, iv8)?;
            check_password(&payload[88..90], &key.derived)?;

            // CFB state continues from where the stretch left it.
            let mut master = Zeroizing::new([0u8; SFS_DISKKEY_SIZE]);
            master.copy_from_slice(&payload[24..88]);
            key.cipher.cfb_decrypt(&mut key.iv, &mut master[..]);

            let engine = legacy_engine(cipher, &salt, &master);
            let info = CryptoInfo::new(cipher, engine, payload_offset + 24, None, iterations);
            Ok((info, None))
        }
        HeaderFormat::Sfs => {
            let mut iv20 = [0u8; MDC_BLOCK_LEN];
            iv20.copy_from_slice(&payload[24..44]);
            let derived = kdf::derive_legacy(password, &salt, iterations);
            check_password(&payload[108..110], &derived)?;

            let mut key64 = Zeroizing::new([0u8; MDC_KEY_LEN]);
            key64.copy_from_slice(&derived[..MDC_KEY_LEN]);
            let mut cfb = MdcCfb::new(&key64, &iv20);
            let mut master = Zeroizing::new([0u8; SFS_DISKKEY_SIZE]);
            master.copy_from_slice(&payload[44..108]);
            cfb.decrypt(&mut master[..]);

            let engine = legacy_engine(cipher, &iv20, &master);
            let info = CryptoInfo::new(cipher, engine, payload_offset + 44, None, iterations);
            let stream = (cipher != CipherId::None).then_some(cfb);
            Ok((info, stream))
        }
        HeaderFormat::V2 => {
            let prf = Prf::from_wire(BigEndian::read_u16(&payload[66..68]))
                .ok_or(VolumeError::BadFormat)?;
            let derived = kdf::derive_pkcs5(password, &salt, iterations, prf)?;
            check_password(&payload[64..66], &derived)?;

            // The master key is ECB-deciphered block by block with a cipher
            // keyed from the derived block; the session cipher is then keyed
            // from the recovered master key.
            let key_cipher = FormatTwoCipher::new(cipher, &derived[..])?;
            let mut master = Zeroizing::new([0u8; E4M_DISKKEY_SIZE]);
            master.copy_from_slice(&payload[32..64]);
            for block in master.chunks_mut(BLOCK_LEN) {
                key_cipher.decrypt_block(block);
            }

            let engine = SectorEngine::V2CbcCascade {
                iv: iv_words(&payload[24..32]),
                cipher: FormatTwoCipher::new(cipher, &master[..])?,
            };
            let info =
                CryptoInfo::new(cipher, engine, payload_offset + 32, Some(prf), iterations);
            Ok((info, None))
        }
    }
}

/// Serialize a fresh header for `params`, generating salt, master key and IV from
/// `entropy`, and return it alongside a ready-to-use session.
pub fn write(
    params: &WriteParams,
    password: &[u8],
    entropy: &mut dyn EntropySource,
) -> Result<(Vec<u8>, CryptoInfo), VolumeError> {
    if !params.cipher.is_legal_for(params.format) {
        return Err(VolumeError::BadFormat);
    }
    if params.filesystem.is_some() && params.format != HeaderFormat::Sfs {
        return Err(VolumeError::BadFormat);
    }
    // With zero iterations the legacy stretches return the bare length-prefixed
    // buffer, whose key-check word is constant for any ordinary-length password;
    // such a header would open under every password. Reading stays lenient for
    // compatibility, writing refuses to mint one.
    if params.iterations == 0 {
        return Err(VolumeError::BadFormat);
    }

    let mut salt = [0u8; SALT_LEN];
    entropy.fill_random(&mut salt);
    let iterations = u32::from(params.iterations);

    let volume = VolumeInfo {
        label: params.label,
        created: params.created,
        serial: params.serial,
    };

    // Serialize magic and the informational packet first; packet 2 follows with
    // the freshly encrypted key material.
    let mut out = Vec::with_capacity(HEADER_SIZE);
    out.extend_from_slice(&params.format.magic());
    push_packet(&mut out, PACKET_VOLUME_INFO, &volume.encode());

    let (payload, emk_offset, engine, prf, fs_encoded) = match params.format {
        HeaderFormat::Legacy => {
            let mut master = Zeroizing::new([0u8; SFS_DISKKEY_SIZE]);
            entropy.fill_random(&mut master[..]);
            let mut iv8 = [0u8; 8];
            iv8.copy_from_slice(&salt[..8]);
            let mut key = key_init_extended(password, iterations, iv8)?;

            let mut payload = vec![0u8; LEGACY_ENCRYPTION_INFO_LEN];
            BigEndian::write_u16(&mut payload[0..2], params.cipher.to_wire());
            BigEndian::write_u16(&mut payload[2..4], params.iterations);
            payload[4..24].copy_from_slice(&salt);
            payload[24..88].copy_from_slice(&master[..]);
            key.cipher.cfb_encrypt(&mut key.iv, &mut payload[24..88]);
            BigEndian::write_u16(&mut payload[88..90], kdf::key_check(&key.derived));

            let engine = legacy_engine(params.cipher, &salt, &master);
            (payload, 24, engine, None, None)
        }
        HeaderFormat::Sfs => {
            let mut master = Zeroizing::new([0u8; SFS_DISKKEY_SIZE]);
            entropy.fill_random(&mut master[..]);
            let mut iv20 = [0u8; MDC_BLOCK_LEN];
            entropy.fill_random(&mut iv20);
            let derived = kdf::derive_legacy(password, &salt, iterations);
            let mut key64 = Zeroizing::new([0u8; MDC_KEY_LEN]);
            key64.copy_from_slice(&derived[..MDC_KEY_LEN]);
            let mut cfb = MdcCfb::new(&key64, &iv20);

            let mut payload = vec![0u8; SFS_ENCRYPTION_INFO_LEN];
            BigEndian::write_u16(&mut payload[0..2], params.cipher.to_wire());
            BigEndian::write_u16(&mut payload[2..4], params.iterations);
            payload[4..24].copy_from_slice(&salt);
            payload[24..44].copy_from_slice(&iv20);
            payload[44..108].copy_from_slice(&master[..]);
            cfb.encrypt(&mut payload[44..108]);
            BigEndian::write_u16(&mut payload[108..110], kdf::key_check(&derived));

            // Packet 3 rides on the keystream left by the master-key encryption.
            let fs_encoded = params.filesystem.as_ref().map(|fs| {
                let mut enc = fs.encode();
                if params.cipher != CipherId::None {
                    cfb.encrypt(&mut enc);
                }
                enc
            });

            let engine = legacy_engine(params.cipher, &iv20, &master);
            (payload, 44, engine, None, fs_encoded)
        }
        HeaderFormat::V2 => {
            let mut master = Zeroizing::new([0u8; E4M_DISKKEY_SIZE]);
            entropy.fill_random(&mut master[..]);
            let mut iv8 = [0u8; 8];
            entropy.fill_random(&mut iv8);
            let derived = kdf::derive_pkcs5(password, &salt, iterations, params.prf)?;
            let key_cipher = FormatTwoCipher::new(params.cipher, &derived[..])?;

            let mut payload = vec![0u8; V2_ENCRYPTION_INFO_LEN];
            BigEndian::write_u16(&mut payload[0..2], params.cipher.to_wire());
            BigEndian::write_u16(&mut payload[2..4], params.iterations);
            payload[4..24].copy_from_slice(&salt);
            payload[24..32].copy_from_slice(&iv8);
            payload[32..64].copy_from_slice(&master[..]);
            for block in payload[32..64].chunks_mut(BLOCK_LEN) {
                key_cipher.encrypt_block(block);
            }
            BigEndian::write_u16(&mut payload[64..66], kdf::key_check(&derived));
            BigEndian::write_u16(&mut payload[66..68], params.prf.to_wire());

            let engine = SectorEngine::V2CbcCascade {
                iv: iv_words(&iv8),
                cipher: FormatTwoCipher::new(params.cipher, &master[..])?,
            };
            (payload, 32, engine, Some(params.prf), None)
        }
    };

    let pkt2_start = push_packet(&mut out, PACKET_ENCRYPTION_INFO, &payload);
    if let Some(fs) = fs_encoded {
        push_packet(&mut out, PACKET_FILESYSTEM_INFO, &fs);
    }
    // Id-0 terminator, then zero padding out to a full sector.
    out.extend_from_slice(&0u16.to_be_bytes());
    out.resize(HEADER_SIZE, 0);

    let crypto = CryptoInfo::new(
        params.cipher,
        engine,
        pkt2_start + emk_offset,
        prf,
        iterations,
    );
    Ok((out, crypto))
}

/// Returns the absolute offset of the payload just written.
fn push_packet(out: &mut Vec<u8>, id: u16, payload: &[u8]) -> usize {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    let start = out.len();
    out.extend_from_slice(payload);
    start
}

/// Constant-time key-check comparison; the stored word must match the trailing
/// two bytes of the derived block.
fn check_password(stored: &[u8], derived: &[u8; 256]) -> Result<(), VolumeError> {
    if bool::from(stored.ct_eq(&derived[254..256])) {
        Ok(())
    } else {
        Err(VolumeError::WrongPassword)
    }
}

fn legacy_engine(cipher: CipherId, sector_iv: &[u8], master: &[u8; SFS_DISKKEY_SIZE]) -> SectorEngine {
    match cipher {
        CipherId::None => SectorEngine::Identity,
        _ => SectorEngine::LegacyFiveWord {
            iv: iv_words(sector_iv),
            key: *master,
        },
    }
}

fn iv_words<const N: usize>(bytes: &[u8]) -> [u32; N] {
    let mut words = [0u32; N];
    BigEndian::read_u32_into(&bytes[..N * 4], &mut words);
    words
}
