use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};

/// Symlink hops allowed while resolving a path, same limit as the kernel.
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolves `path` as the process owning `root` (e.g. `/proc/<pid>/root`)
/// would, following symlinks relative to that root instead of ours. Components
/// that don't exist yet are appended as they are.
///
/// Absolute symlink targets found inside a container would otherwise escape
/// to the host filesystem when read through `/proc/<pid>/root`.
pub fn resolve_proc_root_links(root: &Path, path: &Path) -> anyhow::Result<PathBuf> {
    let mut pending: VecDeque<OsString> = normal_components(path).into();
    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0;

    while let Some(component) = pending.pop_front() {
        if component == ".." {
            resolved.pop();
            continue;
        }

        let candidate = join_all(root, resolved.iter().chain(std::iter::once(&component)));
        let is_symlink = fs::symlink_metadata(&candidate)
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            resolved.push(component);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            bail!("too many levels of symbolic links in {}", path.display());
        }

        let target = fs::read_link(&candidate)
            .with_context(|| format!("failed to read link {}", candidate.display()))?;
        if target.is_absolute() {
            resolved.clear();
        }
        for target_component in normal_components(&target).into_iter().rev() {
            pending.push_front(target_component);
        }
    }

    Ok(join_all(root, resolved.iter()))
}

fn normal_components(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect()
}

fn join_all<'a>(root: &Path, components: impl Iterator<Item = &'a OsString>) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in components {
        path.push(component);
    }
    path
}

/// Recursively copies the contents of `source` into `destination`, creating it
/// if needed.
pub fn copy_dir_all(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Adds `file_bits` to the mode of every file and `dir_bits` to the mode of
/// every directory under `path`, `path` included.
pub fn add_permission_dir(path: &Path, file_bits: u32, dir_bits: u32) -> io::Result<()> {
    add_mode(path, dir_bits)?;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            add_permission_dir(&entry.path(), file_bits, dir_bits)?;
        } else {
            add_mode(&entry.path(), file_bits)?;
        }
    }
    Ok(())
}

fn add_mode(path: &Path, bits: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | bits);
    fs::set_permissions(path, permissions)
}
