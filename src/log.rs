//! The write-ahead log.
//!
//! Layout of a log file:
//!
//! | Offset                              | Contents                                          |
//! | ----------------------------------- | ------------------------------------------------- |
//! | 0                                   | first sector of the base block, typed as a log    |
//! | `round_up(512, cluster * 512)`      | `"DIRT"`, xxh3 of the vector, xxh3 of the data, vector |
//! | next cluster boundary               | every dirty sector, in vector order               |
//!
//! The log header carries the timestamp of the flush that wrote it. A primary whose two sequence
//! numbers disagree was interrupted mid-flush, and is repaired by replaying the log with the same
//! timestamp over it.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::{
    backend::StorageBackend,
    cell::StorageType,
    config::HealPolicy,
    dirty::DirtyVector,
    error::{FormatError, HiveError, HiveResult},
    format::{BaseBlock, FileType},
    map::BinMap,
    round_up, HBLOCK_SIZE, HSECTOR_SIZE,
};

pub(crate) const VECTOR_SIGNATURE: [u8; 4] = *b"DIRT";
const VECTOR_HEADER_SIZE: usize = 4 + 8 + 8;

fn cluster_bytes(cluster: u32) -> usize {
    cluster.max(1) as usize * HSECTOR_SIZE
}

pub(crate) fn vector_offset(cluster: u32) -> usize {
    round_up(HSECTOR_SIZE, cluster_bytes(cluster))
}

/// Offset of the first logged sector, for a vector covering `sectors` sectors.
pub(crate) fn data_offset(sectors: usize, cluster: u32) -> usize {
    let end = vector_offset(cluster) + VECTOR_HEADER_SIZE + DirtyVector::byte_len(sectors);
    round_up(end, cluster_bytes(cluster))
}

/// Size of the log needed to record `dirty` of `sectors` sectors.
pub(crate) fn log_size(sectors: usize, dirty: usize, cluster: u32) -> u64 {
    (data_offset(sectors, cluster) + dirty * HSECTOR_SIZE) as u64
}

/// Write a complete log for the dirty sectors of the stable area, then make it durable.
///
/// `header` is the base block the primary will carry once the flush completes.
pub(crate) fn write_log(
    log: &mut dyn StorageBackend,
    header: &BaseBlock,
    dirty: &DirtyVector,
    map: &mut BinMap,
    cluster: u32,
) -> HiveResult<()> {
    let mut data = Vec::with_capacity(dirty.count() * HSECTOR_SIZE);
    for (first, count) in dirty.runs() {
        for sector in first..first + count {
            let offset = (sector * HSECTOR_SIZE) as u32;
            data.extend_from_slice(map.bytes(StorageType::Stable, offset, HSECTOR_SIZE)?);
        }
    }
    let vector = dirty.to_bytes();

    let mut log_header = *header;
    log_header.file_type = FileType::Log as u32;
    log_header.sequence2 = log_header.sequence1;
    log_header.update_checksum();

    let data_start = data_offset(dirty.len(), cluster);
    let mut head = vec![0u8; data_start];
    head[..HSECTOR_SIZE].copy_from_slice(&log_header.as_bytes()[..HSECTOR_SIZE]);
    let at = vector_offset(cluster);
    head[at..at + 4].copy_from_slice(&VECTOR_SIGNATURE);
    LittleEndian::write_u64(&mut head[at + 4..at + 12], xxh3_64(&vector));
    LittleEndian::write_u64(&mut head[at + 12..at + 20], xxh3_64(&data));
    head[at + VECTOR_HEADER_SIZE..at + VECTOR_HEADER_SIZE + vector.len()].copy_from_slice(&vector);

    log.write_at(0, &head).map_err(HiveError::Io)?;
    log.write_at(data_start as u64, &data).map_err(HiveError::Io)?;
    log.set_len((data_start + data.len()) as u64)
        .map_err(HiveError::Io)?;
    log.flush().map_err(HiveError::Io)?;
    debug!(
        "Wrote log: {} dirty sectors, 0x{:x} bytes",
        dirty.count(),
        data_start + data.len()
    );
    Ok(())
}

/// Read and check the header of a log, without looking at its vector.
pub(crate) fn read_log_header(log: &mut dyn StorageBackend) -> Result<BaseBlock, FormatError> {
    let mut block = vec![0u8; HBLOCK_SIZE];
    log.read_at(0, &mut block[..HSECTOR_SIZE])
        .map_err(|_| FormatError::LogHeader)?;
    let header = BaseBlock::from_bytes(&block);
    if !header.checksum_ok() || !header.is_clean() {
        return Err(FormatError::LogHeader);
    }
    header
        .validate(FileType::Log)
        .map_err(|_| FormatError::LogHeader)?;
    Ok(header)
}

/// The dirty sectors recorded in a log, laid over the primary image while it loads.
#[derive(Debug)]
pub(crate) struct LogOverlay {
    /// Dirty sectors that will be replayed, in log order
    sectors: Vec<u32>,
    data_start: u64,
    /// Part of the log couldn't be used
    healed: bool,
}

impl LogOverlay {
    /// Open the log matching `base`. With [`HealPolicy::SelfHeal`], a log whose data can only
    /// partly be read still replays everything before the damage.
    pub fn open(
        log: &mut dyn StorageBackend,
        base: &BaseBlock,
        policy: HealPolicy,
        io_buffer_size: usize,
    ) -> HiveResult<Self> {
        let header = read_log_header(log)?;
        if header.timestamp() != base.timestamp() {
            return Err(FormatError::LogHeader.into());
        }
        let sectors = base.length as usize / HSECTOR_SIZE;
        let cluster = base.cluster;
        let at = vector_offset(cluster) as u64;
        let mut vector_header = [0u8; VECTOR_HEADER_SIZE];
        log.read_at(at, &mut vector_header)
            .map_err(|_| FormatError::LogVector)?;
        if vector_header[..4] != VECTOR_SIGNATURE {
            return Err(FormatError::LogVector.into());
        }
        let vector_hash = LittleEndian::read_u64(&vector_header[4..12]);
        let data_hash = LittleEndian::read_u64(&vector_header[12..20]);
        let mut bytes = vec![0u8; DirtyVector::byte_len(sectors)];
        log.read_at(at + VECTOR_HEADER_SIZE as u64, &mut bytes)
            .map_err(|_| FormatError::LogVector)?;
        if xxh3_64(&bytes) != vector_hash {
            return Err(FormatError::LogVector.into());
        }
        let vector = DirtyVector::from_bytes(&bytes, sectors);
        let data_start = data_offset(sectors, cluster) as u64;

        let mut overlay = Self {
            sectors: vector
                .runs()
                .flat_map(|(first, count)| (first..first + count).map(|s| s as u32))
                .collect(),
            data_start,
            healed: false,
        };

        // Check the data before anything is replayed
        let readable = overlay.check_data(log, data_hash, io_buffer_size);
        if readable < overlay.sectors.len() || readable == usize::MAX {
            match policy {
                HealPolicy::Strict => return Err(FormatError::LogTruncated.into()),
                HealPolicy::SelfHeal => {
                    let keep = readable.min(overlay.sectors.len());
                    warn!(
                        "Log data is damaged; replaying {} of {} sectors",
                        keep,
                        overlay.sectors.len()
                    );
                    overlay.sectors.truncate(keep);
                    overlay.healed = true;
                }
            }
        }
        debug!("Log holds {} sectors to replay", overlay.sectors.len());
        Ok(overlay)
    }

    /// Hash the logged data. Returns the number of sectors that could be read, or `usize::MAX`
    /// if all of them were read but the hash didn't match.
    fn check_data(&self, log: &mut dyn StorageBackend, expected: u64, io_buffer_size: usize) -> usize {
        let per_read = (io_buffer_size / HSECTOR_SIZE).max(1);
        let mut buf = vec![0u8; per_read * HSECTOR_SIZE];
        let mut hasher = Xxh3::new();
        let mut done = 0;
        while done < self.sectors.len() {
            let n = per_read.min(self.sectors.len() - done);
            let chunk = &mut buf[..n * HSECTOR_SIZE];
            let offset = self.data_start + (done * HSECTOR_SIZE) as u64;
            if log.read_at(offset, chunk).is_err() {
                // Salvage whatever whole sectors are there
                for i in 0..n {
                    let sector = &mut chunk[i * HSECTOR_SIZE..(i + 1) * HSECTOR_SIZE];
                    if log
                        .read_at(offset + (i * HSECTOR_SIZE) as u64, sector)
                        .is_err()
                    {
                        return done + i;
                    }
                }
                return done + n;
            }
            hasher.update(chunk);
            done += n;
        }
        if hasher.digest() == expected {
            done
        } else {
            usize::MAX
        }
    }

    pub fn healed(&self) -> bool {
        self.healed
    }

    /// Replay every logged sector falling in `buf`, which holds the stable area starting at
    /// `offset`. Returns the replayed sectors as `(first, count)` runs.
    pub fn apply(
        &mut self,
        log: &mut dyn StorageBackend,
        offset: u32,
        buf: &mut [u8],
        policy: HealPolicy,
    ) -> HiveResult<Vec<(u32, u32)>> {
        let first_sector = offset / HSECTOR_SIZE as u32;
        let end_sector = first_sector + (buf.len() / HSECTOR_SIZE) as u32;
        let mut i = self.sectors.partition_point(|s| *s < first_sector);
        let mut runs = Vec::new();
        while i < self.sectors.len() && self.sectors[i] < end_sector {
            let start = i;
            while i + 1 < self.sectors.len()
                && self.sectors[i + 1] == self.sectors[i] + 1
                && self.sectors[i + 1] < end_sector
            {
                i += 1;
            }
            i += 1;
            let sector = self.sectors[start];
            let count = i - start;
            let at = (sector - first_sector) as usize * HSECTOR_SIZE;
            let dst = &mut buf[at..at + count * HSECTOR_SIZE];
            let src = self.data_start + (start * HSECTOR_SIZE) as u64;
            if let Err(e) = log.read_at(src, dst) {
                match policy {
                    HealPolicy::Strict => return Err(HiveError::Io(e)),
                    HealPolicy::SelfHeal => {
                        warn!("Log became unreadable at sector {}: {}", sector, e);
                        self.sectors.truncate(start);
                        self.healed = true;
                        break;
                    }
                }
            }
            runs.push((sector, count as u32));
        }
        Ok(runs)
    }
}
