//! Builds the `<build-id>/<binary name>` symlink tree the converter searches
//! for debug information.

use crate::errors::SymbolizeError;
use crate::subprocess::{excerpt, ToolCommand};
use object::{Object, ReadCache};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Base-name prefixes of the kernel image as the build-id lister reports it.
pub const KERNEL_IMAGE_PREFIXES: [&str; 2] = ["[kernel.kallsyms]", "vmlinux"];

/// Link name used for every kernel image. Kernel samples do not map to a
/// concrete file name on disk, so the converter looks the kernel up under
/// this name instead.
pub const KERNEL_SYMBOL_NAME: &str = "vmlinux";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildIdEntry {
    pub build_id: String,
    pub path: PathBuf,
}

impl BuildIdEntry {
    /// Name of the symlink inside the build-id directory.
    pub fn link_name(&self) -> Option<String> {
        let base = self.path.file_name()?.to_string_lossy();
        if is_kernel_image(&base) {
            Some(KERNEL_SYMBOL_NAME.to_string())
        } else {
            Some(base.into_owned())
        }
    }
}

fn is_kernel_image(base_name: &str) -> bool {
    KERNEL_IMAGE_PREFIXES
        .iter()
        .any(|prefix| base_name.starts_with(prefix))
}

fn is_build_id(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses `<build-id> <path>` lines. Malformed lines are logged and skipped.
pub fn parse_build_id_list(listing: &str) -> Vec<BuildIdEntry> {
    let mut entries = Vec::new();
    for (lineno, line) in listing.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = line
            .split_once(char::is_whitespace)
            .map(|(id, path)| (id, path.trim()))
            .filter(|(id, path)| is_build_id(id) && !path.is_empty());
        match parsed {
            Some((id, path)) => entries.push(BuildIdEntry {
                build_id: id.to_ascii_lowercase(),
                path: PathBuf::from(path),
            }),
            None => log::warn!("skipping malformed build-id line {}: {:?}", lineno + 1, line),
        }
    }
    entries
}

/// GNU build id embedded in the ELF object at `path`, if it can be read.
fn embedded_build_id(path: &Path) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    let cache = ReadCache::new(file);
    let obj = object::File::parse(&cache).ok()?;
    let id = obj.build_id().ok()??;
    Some(id.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Creates the link for one entry. `Ok(false)` means the entry was skipped.
fn link_entry(dest_dir: &Path, entry: &BuildIdEntry, name: &str) -> Result<bool, SymbolizeError> {
    if name != KERNEL_SYMBOL_NAME {
        if let Some(actual) = embedded_build_id(&entry.path) {
            if actual != entry.build_id {
                log::warn!(
                    "{} has build id {} but the capture recorded {}, not linking it",
                    entry.path.display(),
                    actual,
                    entry.build_id
                );
                return Ok(false);
            }
        }
    }

    let dir = dest_dir.join(&entry.build_id);
    fs::create_dir_all(&dir).map_err(|source| SymbolizeError::Io {
        path: dir.clone(),
        source,
    })?;

    let link = dir.join(name);
    match std::os::unix::fs::symlink(&entry.path, &link) {
        Ok(()) => {
            log::debug!("linked {} -> {}", link.display(), entry.path.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(true),
        Err(source) => Err(SymbolizeError::Io { path: link, source }),
    }
}

/// Links every entry into `dest_dir` and returns how many binaries the tree
/// now holds for them.
pub fn link_entries(dest_dir: &Path, entries: &[BuildIdEntry]) -> Result<usize, SymbolizeError> {
    fs::create_dir_all(dest_dir).map_err(|source| SymbolizeError::Io {
        path: dest_dir.to_path_buf(),
        source,
    })?;

    let mut seen = HashSet::new();
    let mut linked = 0;
    for entry in entries {
        let Some(name) = entry.link_name() else {
            log::warn!("no file name in {}, skipping", entry.path.display());
            continue;
        };
        if !seen.insert((entry.build_id.clone(), name.clone())) {
            continue;
        }
        if link_entry(dest_dir, entry, &name)? {
            linked += 1;
        }
    }
    Ok(linked)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolResolver {
    lister: ToolCommand,
    stderr_limit: usize,
}

impl SymbolResolver {
    /// `lister` is run with the capture file appended, and must print
    /// `<build-id> <path>` lines.
    pub fn new(lister: ToolCommand, stderr_limit: usize) -> Self {
        Self {
            lister,
            stderr_limit,
        }
    }

    /// `perf buildid-list -i <capture>`
    pub fn perf(perf: &str, stderr_limit: usize) -> Self {
        Self::new(ToolCommand::new(perf, ["buildid-list", "-i"]), stderr_limit)
    }

    pub async fn build_lookup_tree(
        &self,
        dest_dir: &Path,
        capture_file: &Path,
    ) -> Result<usize, SymbolizeError> {
        let command = self.lister.with_path(capture_file);
        log::debug!("running {}", command);

        let output = command
            .to_piped_command()
            .output()
            .await
            .map_err(|source| SymbolizeError::Spawn {
                command: command.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(SymbolizeError::ListFailed {
                command: command.to_string(),
                status: output.status,
                stderr: excerpt(&output.stderr, self.stderr_limit),
            });
        }

        let entries = parse_build_id_list(&String::from_utf8_lossy(&output.stdout));
        let dest_dir = dest_dir.to_path_buf();
        let linked = tokio::task::spawn_blocking(move || link_entries(&dest_dir, &entries)).await??;
        Ok(linked)
    }
}
