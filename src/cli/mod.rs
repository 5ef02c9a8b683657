use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The .bz2 file to decompress.
    #[arg(required = true)]
    pub file: PathBuf,

    /// Overwrite the output file if it already exists.
    #[arg(short, long)]
    pub force: bool,

    /// Print timing and pipeline statistics after decompression.
    #[arg(short, long)]
    pub verbose: bool,

    /// Number of decode worker threads. [0 = auto-detect based on CPU cores]
    #[arg(long, default_value_t = 0)]
    pub threads: usize,

    /// How many decoded blocks may be buffered ahead of the writer.
    #[arg(long, default_value_t = 4)]
    pub max_in_flight: usize,

    /// Bytes read from the input per I/O operation.
    #[arg(long, default_value_t = 128 * 1024)]
    pub chunk_size: usize,
}

/// Derive the output path by stripping the `.bz2` suffix. Returns `None`
/// when the input does not carry it, rather than guessing a name.
pub fn output_path(input: &Path) -> Option<PathBuf> {
    match input.extension() {
        Some(ext) if ext == "bz2" => Some(input.with_extension("")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_only_the_bz2_suffix() {
        assert_eq!(
            output_path(Path::new("data/archive.tar.bz2")),
            Some(PathBuf::from("data/archive.tar"))
        );
        assert_eq!(output_path(Path::new("plain.txt")), None);
        assert_eq!(output_path(Path::new("noext")), None);
    }
}
