//! Sequence collections: the identifying content of a genome.
//!
//! Each FASTA record becomes an annotated sequence digest: the full header,
//! the length, and the truncated SHA-512 of the raw residues. The record's
//! attributes are joined with the attribute separator (0x1E) and digested;
//! the collection digest is the digest of those record digests joined with the
//! item separator (0x1F). This matches the digests published by refgenie
//! servers.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::str::FromStr;

use camino::Utf8Path;
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::digest::{hex_encode, trunc512_digest};
use crate::error::RegistryError;
use crate::store::write_bytes_atomic;

pub const CONTENT_ALL_A_IN_B: u32 = 1 << 0;
pub const CONTENT_ALL_B_IN_A: u32 = 1 << 1;
pub const LENGTHS_ALL_A_IN_B: u32 = 1 << 2;
pub const LENGTHS_ALL_B_IN_A: u32 = 1 << 3;
pub const NAMES_ALL_A_IN_B: u32 = 1 << 4;
pub const NAMES_ALL_B_IN_A: u32 = 1 << 5;
pub const CONTENT_A_ORDER: u32 = 1 << 6;
pub const CONTENT_B_ORDER: u32 = 1 << 7;
pub const CONTENT_ANY_SHARED: u32 = 1 << 8;
pub const LENGTHS_ANY_SHARED: u32 = 1 << 9;
pub const NAMES_ANY_SHARED: u32 = 1 << 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub name: String,
    pub length: u64,
    pub sequence: String,
}

const ATTR_SEPARATOR: char = '\u{1e}';
const ITEM_SEPARATOR: char = '\u{1f}';

impl SequenceRecord {
    /// Digest of one annotated sequence: `name`, `length`, `sequence`.
    pub fn digest(&self) -> String {
        let flat = format!(
            "{}{ATTR_SEPARATOR}{}{ATTR_SEPARATOR}{}",
            self.name, self.length, self.sequence
        );
        trunc512_digest(flat.as_bytes())
    }
}

/// Digest of an ordered list of sequence records.
pub fn collection_digest(records: &[SequenceRecord]) -> String {
    let flat = records
        .iter()
        .map(SequenceRecord::digest)
        .collect::<Vec<_>>()
        .join(&ITEM_SEPARATOR.to_string());
    trunc512_digest(flat.as_bytes())
}

/// Parse a FASTA file (plain or gzip) into sequence records.
pub fn fasta_records(path: &Utf8Path) -> Result<Vec<SequenceRecord>, RegistryError> {
    let read_err = |message: String| RegistryError::DigestComputation {
        path: path.to_path_buf(),
        message,
    };
    parse_fasta(open_fasta(path).map_err(read_err)?).map_err(read_err)
}

fn open_fasta(path: &Utf8Path) -> Result<Box<dyn BufRead>, String> {
    let mut file = File::open(path.as_std_path()).map_err(|err| err.to_string())?;
    let mut magic = [0u8; 2];
    let gzipped =
        file.read(&mut magic).map_err(|err| err.to_string())? == 2 && magic == [0x1f, 0x8b];
    let file = File::open(path.as_std_path()).map_err(|err| err.to_string())?;
    Ok(if gzipped {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

/// A sequence name with an optional `start-end` region. Bounds are 0-based
/// and end-exclusive; an end past the sequence is clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locus {
    pub name: String,
    pub range: Option<(usize, usize)>,
}

impl FromStr for Locus {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| RegistryError::InvalidLocus {
            locus: value.to_string(),
            message: message.to_string(),
        };
        let (name, range) = match value.split_once(':') {
            None => (value, None),
            Some((name, range)) => {
                let (start, end) = range
                    .split_once('-')
                    .ok_or_else(|| invalid("expected name:start-end"))?;
                let start: usize = start.trim().parse().map_err(|_| invalid("bad start"))?;
                let end: usize = end.trim().parse().map_err(|_| invalid("bad end"))?;
                if start > end {
                    return Err(invalid("start is past end"));
                }
                (name, Some((start, end)))
            }
        };
        if name.is_empty() {
            return Err(invalid("missing sequence name"));
        }
        Ok(Self {
            name: name.to_string(),
            range,
        })
    }
}

/// Read the residues of `locus` from a FASTA file. A record matches on its
/// full header or on the header's first word.
pub fn read_locus(path: &Utf8Path, locus: &Locus) -> Result<String, RegistryError> {
    let read_err = |message: String| RegistryError::DigestComputation {
        path: path.to_path_buf(),
        message,
    };
    let reader = open_fasta(path).map_err(read_err)?;
    let mut residues: Option<String> = None;
    for line in reader.split(b'\n') {
        let line = line.map_err(|err| read_err(err.to_string()))?;
        let line = String::from_utf8(line).map_err(|err| read_err(err.to_string()))?;
        let line = line.trim_end_matches('\r');
        if let Some(header) = line.strip_prefix('>') {
            if residues.is_some() {
                break;
            }
            let first = header.split_whitespace().next().unwrap_or_default();
            if header == locus.name || first == locus.name {
                residues = Some(String::new());
            }
            continue;
        }
        if let Some(residues) = residues.as_mut() {
            residues.push_str(line);
        }
    }
    let residues = residues.ok_or_else(|| RegistryError::InvalidLocus {
        locus: locus.name.clone(),
        message: format!("no such sequence in {path}"),
    })?;
    let Some((start, end)) = locus.range else {
        return Ok(residues);
    };
    let end = end.min(residues.len());
    let start = start.min(end);
    residues
        .get(start..end)
        .map(str::to_string)
        .ok_or_else(|| read_err("sequence is not ASCII".to_string()))
}

fn parse_fasta(reader: impl BufRead) -> Result<Vec<SequenceRecord>, String> {
    let mut records = Vec::new();
    let mut current: Option<(String, u64, Sha512)> = None;
    for line in reader.split(b'\n') {
        let line = line.map_err(|err| err.to_string())?;
        let line = String::from_utf8(line).map_err(|err| err.to_string())?;
        if line.starts_with('>') {
            if let Some(done) = current.take() {
                records.push(finish_record(done));
            }
            current = Some((line.replace('>', ""), 0, Sha512::new()));
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let Some((_, length, hasher)) = current.as_mut() else {
            return Err("sequence data before the first FASTA header".to_string());
        };
        *length += line.len() as u64;
        hasher.update(line.as_bytes());
    }
    if let Some(done) = current.take() {
        records.push(finish_record(done));
    }
    if records.is_empty() {
        return Err("no FASTA records found".to_string());
    }
    Ok(records)
}

fn finish_record((name, length, hasher): (String, u64, Sha512)) -> SequenceRecord {
    let digest = hasher.finalize();
    SequenceRecord {
        name,
        length,
        sequence: hex_encode(&digest[..24]),
    }
}

pub fn save_records(path: &Utf8Path, records: &[SequenceRecord]) -> Result<(), RegistryError> {
    let content = serde_json::to_vec_pretty(records)
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn load_records(path: &Utf8Path) -> Result<Vec<SequenceRecord>, RegistryError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| RegistryError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content).map_err(|err| RegistryError::schema(path, err.to_string()))
}

/// How two collections relate, derived from the comparison flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compatibility {
    Identical,
    CompatibleSuperset,
    Incompatible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comparison {
    pub flags: u32,
    pub compatibility: Compatibility,
}

impl Comparison {
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }
}

pub fn compare_records(a: &[SequenceRecord], b: &[SequenceRecord]) -> Comparison {
    let mut flags = 0u32;

    let content_b: HashSet<&str> = b.iter().map(|r| r.sequence.as_str()).collect();
    let content_a: HashSet<&str> = a.iter().map(|r| r.sequence.as_str()).collect();
    let a_in_b: Vec<bool> = a.iter().map(|r| content_b.contains(r.sequence.as_str())).collect();
    let b_in_a: Vec<bool> = b.iter().map(|r| content_a.contains(r.sequence.as_str())).collect();

    if a_in_b.iter().any(|x| *x) {
        flags |= CONTENT_ANY_SHARED;
        if shared_order_preserved(a, b) {
            flags |= CONTENT_A_ORDER;
        }
    }
    if b_in_a.iter().any(|x| *x) && shared_order_preserved(b, a) {
        flags |= CONTENT_B_ORDER;
    }
    if a_in_b.iter().all(|x| *x) {
        flags |= CONTENT_ALL_A_IN_B;
    }
    if b_in_a.iter().all(|x| *x) {
        flags |= CONTENT_ALL_B_IN_A;
    }

    let names_a: HashSet<&str> = a.iter().map(|r| r.name.as_str()).collect();
    let names_b: HashSet<&str> = b.iter().map(|r| r.name.as_str()).collect();
    if names_a.iter().any(|n| names_b.contains(n)) {
        flags |= NAMES_ANY_SHARED;
    }
    if names_a.is_subset(&names_b) {
        flags |= NAMES_ALL_A_IN_B;
    }
    if names_b.is_subset(&names_a) {
        flags |= NAMES_ALL_B_IN_A;
    }

    let lengths_a: HashSet<u64> = a.iter().map(|r| r.length).collect();
    let lengths_b: HashSet<u64> = b.iter().map(|r| r.length).collect();
    if lengths_a.iter().any(|l| lengths_b.contains(l)) {
        flags |= LENGTHS_ANY_SHARED;
    }
    if lengths_a.is_subset(&lengths_b) {
        flags |= LENGTHS_ALL_A_IN_B;
    }
    if lengths_b.is_subset(&lengths_a) {
        flags |= LENGTHS_ALL_B_IN_A;
    }

    let both_ways = CONTENT_ALL_A_IN_B | CONTENT_ALL_B_IN_A | NAMES_ALL_A_IN_B | NAMES_ALL_B_IN_A;
    let compatibility = if flags & both_ways == both_ways && flags & CONTENT_A_ORDER != 0 {
        Compatibility::Identical
    } else if flags & (CONTENT_ALL_A_IN_B | CONTENT_ALL_B_IN_A) != 0 {
        Compatibility::CompatibleSuperset
    } else {
        Compatibility::Incompatible
    };
    Comparison {
        flags,
        compatibility,
    }
}

/// Whether the sequences of `a` found in `b` appear in `b` in the same order.
fn shared_order_preserved(a: &[SequenceRecord], b: &[SequenceRecord]) -> bool {
    let positions: Vec<usize> = a
        .iter()
        .filter_map(|r| b.iter().position(|other| other.sequence == r.sequence))
        .collect();
    positions.windows(2).all(|w| w[0] <= w[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, seq: &str) -> SequenceRecord {
        SequenceRecord {
            name: name.to_string(),
            length: seq.len() as u64,
            sequence: trunc512_digest(seq.as_bytes()),
        }
    }

    #[test]
    fn parse_fasta_records_and_digest() {
        let fasta = ">chr1 primary\nACGT\nacgt\n>chrM\nTTTT\n";
        let records = parse_fasta(fasta.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "chr1 primary");
        assert_eq!(records[0].length, 8);
        assert_eq!(records[0].sequence, trunc512_digest(b"ACGTacgt"));
        assert_eq!(records[1].length, 4);

        let rewrapped = parse_fasta(">chr1 primary\nACGTacgt\n\n>chrM\nTT\nTT\n".as_bytes()).unwrap();
        assert_eq!(collection_digest(&records), collection_digest(&rewrapped));
        assert_eq!(
            collection_digest(&records),
            "1a6047112e43fa0994f01d6abe9c6941b92df6a5e7f8703c"
        );
    }

    #[test]
    fn digests_match_published_values() {
        assert_eq!(
            trunc512_digest(b"ACGT"),
            "68a178f7c740c5c240aa67ba41843b119d3bf9f8b0f0ac36"
        );
        let records = parse_fasta(">chr1\nACGT\n>chr2\nGG\n".as_bytes()).unwrap();
        assert_eq!(
            collection_digest(&records),
            "2ad08b2db5791c7ea35c7b0501097879799541b1f70e1ef5"
        );
        let renamed = parse_fasta(">chr1 x\nACGT\n>chr2\nGG\n".as_bytes()).unwrap();
        assert_ne!(collection_digest(&records), collection_digest(&renamed));
    }

    #[test]
    fn locus_parsing_and_extraction() {
        let locus: Locus = "chr1:2-6".parse().unwrap();
        assert_eq!(locus.name, "chr1");
        assert_eq!(locus.range, Some((2, 6)));
        assert!("chr1:6-2".parse::<Locus>().is_err());
        assert!("chr1:x".parse::<Locus>().is_err());

        let temp = tempfile::TempDir::new().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(temp.path().join("g.fa")).unwrap();
        fs::write(path.as_std_path(), ">chr1 primary\nACGT\nTTGG\n>chr2\nCC\n").unwrap();

        assert_eq!(read_locus(&path, &locus).unwrap(), "GTTT");
        assert_eq!(read_locus(&path, &"chr2".parse().unwrap()).unwrap(), "CC");
        assert_eq!(read_locus(&path, &"chr1:6-100".parse().unwrap()).unwrap(), "GG");
        assert!(matches!(
            read_locus(&path, &"chrM".parse().unwrap()),
            Err(RegistryError::InvalidLocus { .. })
        ));
    }

    #[test]
    fn parse_fasta_rejects_headerless_input() {
        assert!(parse_fasta("ACGT\n".as_bytes()).is_err());
        assert!(parse_fasta("".as_bytes()).is_err());
    }

    #[test]
    fn compare_identical_superset_and_incompatible() {
        let a = vec![record("chr1", "ACGT"), record("chr2", "GGGG")];
        let b = vec![
            record("chr1", "ACGT"),
            record("chr2", "GGGG"),
            record("chrM", "TTTT"),
        ];
        let c = vec![record("x", "CCCCCC")];

        assert_eq!(compare_records(&a, &a).compatibility, Compatibility::Identical);
        let superset = compare_records(&a, &b);
        assert_eq!(superset.compatibility, Compatibility::CompatibleSuperset);
        assert!(superset.has(CONTENT_ALL_A_IN_B));
        assert!(!superset.has(CONTENT_ALL_B_IN_A));
        assert_eq!(compare_records(&a, &c).compatibility, Compatibility::Incompatible);
    }
}
