//! Generates a ZeroMQ CURVE keypair and writes the public key to the given
//! file and the secret key to the same name with `.secret` appended.
//!
//! Grounded in `original_source/src/tools/rhizo-keygen.c`. The original
//! restricts the secret key file via `umask(0066)` before writing; this
//! sets the file mode directly via `std::os::unix::fs::PermissionsExt`
//! instead, which holds regardless of whatever umask the calling shell
//! already has in effect.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

/// Generate a ZeroMQ CURVE keypair for netfuse client/server encryption.
///
/// The public key is written to `public-key-file`; the secret key is
/// written to `public-key-file` with `.secret` appended.
#[derive(Parser, Debug)]
#[command(name = "netfuse-keygen", version)]
struct Cli {
    /// File to write the z85-encoded public key to
    public_key_file: PathBuf,
}

fn write_key_file(path: &PathBuf, z85: &str, mode: u32) -> std::io::Result<()> {
    std::fs::write(path, z85)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let keypair = match zmq::CurveKeyPair::new() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("could not generate a CURVE keypair: {e}");
            eprintln!("if this is ENOTSUP, install libsodium and rebuild libzmq against it");
            return ExitCode::from(2);
        }
    };

    let public_z85 = match zmq::z85_encode(&keypair.public_key) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not z85-encode the public key: {e}");
            return ExitCode::from(2);
        }
    };
    let secret_z85 = match zmq::z85_encode(&keypair.secret_key) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not z85-encode the secret key: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = write_key_file(&cli.public_key_file, &public_z85, 0o644) {
        eprintln!("failed to open file {} for writing: {e}", cli.public_key_file.display());
        return ExitCode::from(3);
    }

    let secret_path = {
        let mut name = cli.public_key_file.into_os_string();
        name.push(".secret");
        PathBuf::from(name)
    };
    if let Err(e) = write_key_file(&secret_path, &secret_z85, 0o600) {
        eprintln!("failed to open file {} for writing: {e}", secret_path.display());
        return ExitCode::from(4);
    }

    ExitCode::SUCCESS
}
