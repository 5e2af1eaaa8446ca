use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use granary::signing::Keypair;

/// Generate a new signing keypair.
///
/// The secret key goes to stdout (or a file with `--output`) in the
/// same format `nix-store --generate-binary-cache-key` produces, so it
/// can be referenced directly from `secret-key-file` in the server
/// configuration. The public key is printed to stderr either way.
#[derive(Debug, Parser)]
pub struct GenerateKey {
    /// Name of the key, e.g. "mycache-1".
    ///
    /// The name is embedded in every signature, and clients configure
    /// it as part of their trusted public keys.
    #[clap(long)]
    name: String,

    /// Write the secret key to a file instead of stdout.
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,
}

pub async fn run(sub: &GenerateKey) -> Result<()> {
    let keypair = Keypair::generate(&sub.name)?;

    match &sub.output {
        Some(path) => {
            write_secret(path, &keypair.export_keypair())?;
            eprintln!("Secret key written to {}", path.display());
        }
        None => {
            println!("{}", keypair.export_keypair());
        }
    }

    eprintln!("Public key: {}", keypair.export_public_key());

    Ok(())
}

#[cfg(unix)]
fn write_secret(path: &std::path::Path, contents: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;

    file.write_all(contents.as_bytes())?;
    file.write_all(b"\n")?;

    Ok(())
}

#[cfg(not(unix))]
fn write_secret(path: &std::path::Path, contents: &str) -> Result<()> {
    std::fs::write(path, format!("{}\n", contents))?;
    Ok(())
}
