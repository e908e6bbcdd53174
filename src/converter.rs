//! Turns a raw capture into a gzipped pprof profile with an external
//! converter (`perf_to_profile`).

use crate::errors::ConversionError;
use crate::subprocess::{excerpt, ToolCommand};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;

/// Search-path variable pprof tooling consults for `<dir>/<build-id>/<name>`.
pub const DEFAULT_SYMBOL_PATH_VAR: &str = "PPROF_BINARY_PATH";

/// Gzip compressed serialized pprof profile, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileArtifact {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatConverter {
    converter: ToolCommand,
    symbol_path_var: String,
    stderr_limit: usize,
}

impl FormatConverter {
    /// `converter` is run with the capture file appended and must write the
    /// profile to stdout.
    pub fn new(
        converter: ToolCommand,
        symbol_path_var: impl Into<String>,
        stderr_limit: usize,
    ) -> Self {
        Self {
            converter,
            symbol_path_var: symbol_path_var.into(),
            stderr_limit,
        }
    }

    /// `perf_to_profile -f -o /dev/stdout -i <capture>`; `-f` because the
    /// converter refuses to write to an existing output path.
    pub fn perf_to_profile(program: &str, stderr_limit: usize) -> Self {
        Self::new(
            ToolCommand::new(program, ["-f", "-o", "/dev/stdout", "-i"]),
            DEFAULT_SYMBOL_PATH_VAR,
            stderr_limit,
        )
    }

    pub async fn convert(
        &self,
        capture_file: &Path,
        symbol_dir: &Path,
    ) -> Result<ProfileArtifact, ConversionError> {
        let command = self.converter.with_path(capture_file);
        log::debug!(
            "running {} with {}={}",
            command,
            self.symbol_path_var,
            symbol_dir.display()
        );

        let output = command
            .to_piped_command()
            .env(&self.symbol_path_var, symbol_dir)
            .output()
            .await
            .map_err(|source| ConversionError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ConversionError::Failed {
                command: command.to_string(),
                status: output.status,
                stderr: excerpt(&output.stderr, self.stderr_limit),
            });
        }
        if output.stdout.is_empty() {
            return Err(ConversionError::EmptyOutput {
                command: command.to_string(),
            });
        }

        let bytes = gzip(&output.stdout).map_err(ConversionError::Compress)?;
        log::debug!(
            "converted {} into {} bytes ({} compressed)",
            capture_file.display(),
            output.stdout.len(),
            bytes.len()
        );
        Ok(ProfileArtifact { bytes })
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
