//! Very thin FASTA reader/writer. Only supports batch IO.

use crate::seq::FastSeq;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};

/// Write records into the writer.
pub fn write_fasta<W: Write>(wtr: &mut BufWriter<W>, records: &[FastSeq]) -> std::io::Result<()> {
    for rec in records {
        writeln!(wtr, ">{}\n{}", rec.name, rec.seq)?;
    }
    Ok(())
}

/// Read a file, or stdin when no path is given, and return the parsed records.
pub fn read_fasta<P: AsRef<std::path::Path>>(file: &Option<P>) -> std::io::Result<Vec<FastSeq>> {
    let stdin = std::io::stdin();
    let mut reader: Box<dyn BufRead> = match file {
        Some(file) => std::fs::File::open(file).map(BufReader::new).map(Box::new)?,
        None => {
            let lock = stdin.lock();
            Box::new(BufReader::new(lock))
        }
    };
    let mut contents = String::new();
    reader.read_to_string(&mut contents)?;
    Ok(parse_fasta(&contents))
}

pub fn parse_fasta(contents: &str) -> Vec<FastSeq> {
    let mut records = Vec::new();
    for block in contents.split('>').skip(1) {
        let mut lines = block.lines();
        let name = match lines.next() {
            Some(header) => header.trim().to_string(),
            None => continue,
        };
        let seq: String = lines.flat_map(|l| l.trim().chars()).collect();
        records.push(FastSeq::new(name, seq));
    }
    records
}
