use std::{fs, io};

use base16ct::lower::encode_string;
use sha2::{Digest, Sha256};

pub mod clock;
pub mod config;
pub mod data;
#[cfg(feature = "db")]
pub mod db;
pub mod schema;

/// Streams the file through SHA-256 and returns the lowercase hex digest.
pub fn hash_file(mut file: fs::File) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let rv: [u8; 32] = hasher.finalize().into();
    Ok(encode_string(&rv))
}
