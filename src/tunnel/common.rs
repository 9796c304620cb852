use crate::error::{VpnError, VpnResult};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tracing::{debug, info};

/// Common helpers shared by the command-driven tunnel backends

/// Check if a binary is available in the system PATH
pub async fn check_binary_available(binary: &str) -> bool {
    match Command::new("which")
        .arg(binary)
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Run a command line given as program + arguments, returning stdout.
/// A non-zero exit becomes `VpnError::CommandFailed`.
pub async fn run_command(argv: &[String]) -> VpnResult<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| VpnError::InvalidParameter("Empty command line".to_string()))?;

    let cmd = argv.join(" ");
    debug!("Running: {}", cmd);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| VpnError::CommandFailed {
            cmd: cmd.clone(),
            code: None,
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(VpnError::CommandFailed {
            cmd,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> VpnResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Delete a file if it exists
pub async fn delete_file(path: &Path) -> VpnResult<()> {
    if path.exists() {
        tokio::fs::remove_file(path).await?;
        debug!("Deleted file: {:?}", path);
    }
    Ok(())
}

/// Check if an interface exists
pub async fn interface_exists(interface: &str) -> bool {
    Path::new(&format!("/sys/class/net/{}", interface)).exists()
}

/// Read at most `max_bytes` from the end of a log file
pub async fn read_log_tail(path: &Path, max_bytes: u64) -> VpnResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len > max_bytes {
        file.seek(std::io::SeekFrom::Start(len - max_bytes)).await?;
    }

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Replace `{name}` placeholders in each argument
pub fn render_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}
