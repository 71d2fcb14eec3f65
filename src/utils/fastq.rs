use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use log::debug;
use seq_io::fastq::{Reader as FastqReader, Record};

use crate::utils::file::is_gzipped;

fn open_fastq(path: &Path) -> io::Result<FastqReader<Box<dyn Read>>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_gzipped(path)? {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(FastqReader::new(reader))
}

/// Header line (without `@`) of the first record, or `None` for an empty file.
pub fn first_header(path: &Path) -> io::Result<Option<String>> {
    let mut reader = open_fastq(path)?;
    match reader.next() {
        Some(Ok(record)) => Ok(Some(String::from_utf8_lossy(record.head()).trim().to_string())),
        Some(Err(e)) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid FASTQ in {}: {}", path.display(), e),
        )),
        None => Ok(None),
    }
}

/// Checks that the first records of two mate files are an R1/R2 pair.
pub fn mates_agree(read1: &Path, read2: &Path) -> io::Result<bool> {
    match (first_header(read1)?, first_header(read2)?) {
        (Some(h1), Some(h2)) => Ok(compare_read_ids(&h1, &h2)),
        (None, None) => Ok(true),
        _ => {
            debug!("Only one of {} and {} is empty", read1.display(), read2.display());
            Ok(false)
        }
    }
}

/// Compares the headers of two FASTQ reads.
///
/// # Arguments
///
/// * `id1`: &str - header of read 1
/// * `id2`: &str - header of read 2
///
/// # Returns
/// bool: true if reads are a matched pair.
///
pub fn compare_read_ids(id1: &str, id2: &str) -> bool {
    // Casava 1.8+ format first (space-separated)
    let id1_parts: Vec<&str> = id1.splitn(2, ' ').collect();
    let id2_parts: Vec<&str> = id2.splitn(2, ' ').collect();

    if id1_parts.len() == 2 && id2_parts.len() == 2 {
        if id1_parts[0] != id2_parts[0] {
            return false;
        }
        let read_num1 = id1_parts[1].split(':').next().unwrap_or("");
        let read_num2 = id2_parts[1].split(':').next().unwrap_or("");
        return (read_num1 == "1" && read_num2 == "2") || (read_num1 == "2" && read_num2 == "1");
    }

    // Fallback to /1 and /2 format
    if let (Some(base1), Some(base2)) = (id1.strip_suffix("/1"), id2.strip_suffix("/2")) {
        return base1 == base2;
    }
    if let (Some(base1), Some(base2)) = (id1.strip_suffix("/2"), id2.strip_suffix("/1")) {
        return base1 == base2;
    }

    // Bare ids with no mate marker pair by equality.
    id1_parts.len() == 1 && id2_parts.len() == 1 && id1 == id2
}


#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_compare_read_ids() {
        assert!(compare_read_ids("r1 1:N:0:ACGT", "r1 2:N:0:ACGT"));
        assert!(!compare_read_ids("r1 1:N:0:ACGT", "r2 2:N:0:ACGT"));
        assert!(!compare_read_ids("r1 1:N:0:ACGT", "r1 1:N:0:ACGT"));
        assert!(compare_read_ids("frag7/1", "frag7/2"));
        assert!(!compare_read_ids("frag7/1", "frag8/2"));
        assert!(compare_read_ids("frag7", "frag7"));
    }

    #[test]
    fn test_mates_agree_gzipped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let r1 = dir.path().join("S1_1.fastq.gz");
        let r2 = dir.path().join("S1_2.fastq");
        let mut enc = GzEncoder::new(File::create(&r1)?, Compression::default());
        enc.write_all(b"@read7/1\nACGT\n+\nIIII\n")?;
        enc.finish()?;
        std::fs::write(&r2, b"@read7/2\nTTGA\n+\nIIII\n")?;

        assert_eq!(first_header(&r1)?, Some("read7/1".to_string()));
        assert!(mates_agree(&r1, &r2)?);
        Ok(())
    }

    #[test]
    fn test_mates_disagree() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let r1 = dir.path().join("a.fastq");
        let r2 = dir.path().join("b.fastq");
        std::fs::write(&r1, b"@readA/1\nACGT\n+\nIIII\n")?;
        std::fs::write(&r2, b"")?;
        assert!(!mates_agree(&r1, &r2)?);
        std::fs::write(&r2, b"@readB/2\nACGT\n+\nIIII\n")?;
        assert!(!mates_agree(&r1, &r2)?);
        Ok(())
    }
}
