//! C3: materializes source bytes into a per-deployment working directory.
//! Two variants; neither the teacher nor the wider pack carries archive
//! extraction or git cloning, so this is written directly against the
//! `zip` and `git2` crates in their own idiomatic style.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, instrument};
use zip::ZipArchive;

use crate::error::{Error, ErrorKind};
use crate::logging::PipelineLog;

const DEFAULT_FILE_MODE: u32 = 0o644;

/// Extracts `archive_path` into `target_dir`, which must not already
/// exist. Every entry is checked for path-containment after resolving its
/// components; symlinks and non-regular entries are rejected outright.
#[instrument(skip(archive_path, target_dir))]
pub fn stage_zip(archive_path: &Path, target_dir: &Path) -> Result<(), Error> {
    if target_dir.exists() {
        return Err(Error::custom(
            ErrorKind::Internal,
            format!("target directory {} already exists", target_dir.display()),
        ));
    }

    let file = fs::File::open(archive_path)
        .map_err(|e| Error::source(ErrorKind::Internal, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| Error::source(ErrorKind::Internal, e))?;

    fs::create_dir_all(target_dir).map_err(|e| Error::source(ErrorKind::Internal, e))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::source(ErrorKind::Internal, e))?;

        if entry.is_symlink() {
            return Err(Error::custom(
                ErrorKind::UnsupportedEntryType,
                format!("entry `{}` is a symlink", entry.name()),
            ));
        }

        let dest = safe_join(target_dir, entry.name())?;

        if entry.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| Error::source(ErrorKind::Internal, e))?;
            continue;
        }

        if !entry.is_file() {
            return Err(Error::custom(
                ErrorKind::UnsupportedEntryType,
                format!("entry `{}` is not a regular file", entry.name()),
            ));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::source(ErrorKind::Internal, e))?;
        }

        let mut out = fs::File::create(&dest).map_err(|e| Error::source(ErrorKind::Internal, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| Error::source(ErrorKind::Internal, e))?;

        let mode = entry.unix_mode().filter(|m| *m != 0).unwrap_or(DEFAULT_FILE_MODE);
        set_permissions(&dest, mode)?;
    }

    debug!(entries = archive.len(), "zip archive extracted");
    Ok(())
}

/// Joins `entry_name` onto `root`, rejecting absolute paths and any entry
/// whose resolved path would escape `root`.
fn safe_join(root: &Path, entry_name: &str) -> Result<PathBuf, Error> {
    let mut resolved = root.to_path_buf();

    for component in Path::new(entry_name).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::custom(
                    ErrorKind::ArchiveEscape,
                    format!("entry `{entry_name}` escapes target directory"),
                ));
            }
        }
    }

    if !resolved.starts_with(root) {
        return Err(Error::custom(
            ErrorKind::ArchiveEscape,
            format!("entry `{entry_name}` escapes target directory"),
        ));
    }

    Ok(resolved)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::source(ErrorKind::Internal, e))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), Error> {
    Ok(())
}

/// Performs a shallow (depth-1), single-branch clone of `repo_url`@`branch`
/// into `target_dir`, which must not pre-exist. Progress is written to the
/// pipeline's log sink.
#[instrument(skip(log))]
pub async fn stage_git(
    repo_url: &str,
    branch: &str,
    target_dir: &Path,
    log: &mut PipelineLog,
) -> Result<(), Error> {
    if target_dir.exists() {
        return Err(Error::custom(
            ErrorKind::Internal,
            format!("target directory {} already exists", target_dir.display()),
        ));
    }

    log.info(&format!("cloning {repo_url} (branch {branch}, depth 1)")).await;

    let repo_url = repo_url.to_string();
    let branch = branch.to_string();
    let target_dir = target_dir.to_path_buf();

    let result = tokio::task::spawn_blocking(move || clone_shallow(&repo_url, &branch, &target_dir))
        .await
        .map_err(|e| Error::source(ErrorKind::Internal, e))?;

    match &result {
        Ok(()) => log.info("clone complete").await,
        Err(err) => log.error(&format!("clone failed: {err}")).await,
    }

    result
}

fn clone_shallow(repo_url: &str, branch: &str, target_dir: &Path) -> Result<(), Error> {
    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.depth(1);

    let mut builder = git2::build::RepoBuilder::new();
    builder.branch(branch);
    builder.fetch_options(fetch_options);

    builder
        .clone(repo_url, target_dir)
        .map(|_repo| ())
        .map_err(|e| Error::source(ErrorKind::CloneFailed, e))?;

    info!(repo_url, branch, "git clone complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("site.zip");
        write_zip(&archive_path, &[("index.html", "<h1>OK</h1>")]);

        let target = dir.path().join("out");
        stage_zip(&archive_path, &target).unwrap();

        let contents = fs::read_to_string(target.join("index.html")).unwrap();
        assert_eq!(contents, "<h1>OK</h1>");
    }

    #[test]
    fn rejects_parent_dir_escape() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.zip");
        write_zip(&archive_path, &[("../evil.txt", "pwned")]);

        let target = dir.path().join("out");
        let err = stage_zip(&archive_path, &target).unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::ArchiveEscape);
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn rejects_nested_parent_dir_escape() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.zip");
        write_zip(&archive_path, &[("assets/../../escape.txt", "pwned")]);

        let target = dir.path().join("out");
        let err = stage_zip(&archive_path, &target).unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::ArchiveEscape);
    }

    #[test]
    fn fails_if_target_dir_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("site.zip");
        write_zip(&archive_path, &[("index.html", "hi")]);

        let target = dir.path().join("out");
        fs::create_dir_all(&target).unwrap();

        let err = stage_zip(&archive_path, &target).unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::Internal);
    }
}
