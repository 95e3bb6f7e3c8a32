//! C5: validates build output, copies it into the asset root, and
//! replaces the serving container. Grounded on the stop-old/start-new
//! sequencing in `other_examples/…self-hosted-paas…scheduler.rs`'s
//! `execute_deploy`/`execute_rebuild`.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{info, instrument};
use walkdir::WalkDir;

use crate::error::{Error, ErrorKind};
use crate::model::Slug;
use crate::runtime::{RuntimeAdapter, ServerSpec};

pub struct PublishOutcome {
    pub container_id: String,
}

/// Resolves `content_root`/`output_subdir`, copies it into
/// `<asset_root>/<slug>/`, and replaces the serving container. Does not
/// touch the state store; the caller (Pipeline Orchestrator) transitions
/// status after this returns.
#[instrument(skip(runtime), fields(slug = %slug))]
pub async fn publish(
    runtime: &RuntimeAdapter,
    slug: &Slug,
    content_root: &Path,
    output_subdir: &str,
    asset_root: &Path,
    serve_image: &str,
    base_domain: &str,
    network_name: &str,
) -> Result<PublishOutcome, Error> {
    let output_dir = resolve_output(content_root, output_subdir)?;
    let dest = asset_root.join(&slug.0);
    copy_tree(&output_dir, &dest)?;

    runtime.stop_and_remove(&slug.container_name()).await?;

    let container_id = runtime
        .create_and_start_server(ServerSpec {
            slug: slug.clone(),
            host_asset_dir: dest,
            image: serve_image.to_string(),
            base_domain: base_domain.to_string(),
            network_name: network_name.to_string(),
        })
        .await?;

    info!(slug = %slug, container_id = %container_id, "publish complete");
    Ok(PublishOutcome { container_id })
}

/// Replaces the serving container against assets that are already present
/// on disk (zip-on-disk redeploy), skipping the copy step entirely.
#[instrument(skip(runtime), fields(slug = %slug))]
pub async fn republish_existing_assets(
    runtime: &RuntimeAdapter,
    slug: &Slug,
    asset_root: &Path,
    serve_image: &str,
    base_domain: &str,
    network_name: &str,
) -> Result<PublishOutcome, Error> {
    let dest = asset_root.join(&slug.0);
    if !dest.is_dir() {
        return Err(Error::kind(ErrorKind::AssetsMissing));
    }

    runtime.stop_and_remove(&slug.container_name()).await?;

    let container_id = runtime
        .create_and_start_server(ServerSpec {
            slug: slug.clone(),
            host_asset_dir: dest,
            image: serve_image.to_string(),
            base_domain: base_domain.to_string(),
            network_name: network_name.to_string(),
        })
        .await?;

    Ok(PublishOutcome { container_id })
}

/// Joins `output_subdir` onto `content_root`, the same way
/// `stager::safe_join` joins an archive entry onto its target directory:
/// an absolute path or a `..` component could otherwise walk the
/// resolved path outside `content_root` and publish an arbitrary host
/// directory.
fn resolve_output(content_root: &Path, output_subdir: &str) -> Result<PathBuf, Error> {
    let mut resolved = content_root.to_path_buf();
    for component in Path::new(output_subdir).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::custom(
                    ErrorKind::InvalidRequest,
                    format!("output directory \"{output_subdir}\" escapes the source tree"),
                ));
            }
        }
    }

    if !resolved.starts_with(content_root) || !resolved.is_dir() {
        return Err(Error::custom(
            ErrorKind::OutputMissing,
            format!("output directory \"{output_subdir}\" not found"),
        ));
    }
    Ok(resolved)
}

/// Removes `dest` entirely and recreates it from `src`. Symlinks and
/// non-regular entries in `src` are rejected: a FIFO would block the
/// copier forever, a device node could surface kernel data.
fn copy_tree(src: &Path, dest: &Path) -> Result<(), Error> {
    if dest.exists() {
        fs::remove_dir_all(dest).map_err(|e| Error::source(ErrorKind::Internal, e))?;
    }
    fs::create_dir_all(dest).map_err(|e| Error::source(ErrorKind::Internal, e))?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::source(ErrorKind::Internal, e))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir entries are rooted at src");
        let target = dest.join(relative);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Err(Error::custom(
                ErrorKind::UnsupportedEntryType,
                format!("`{}` is a symlink", entry.path().display()),
            ));
        } else if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::source(ErrorKind::Internal, e))?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::source(ErrorKind::Internal, e))?;
            }
            fs::copy(entry.path(), &target).map_err(|e| Error::source(ErrorKind::Internal, e))?;
            let perms = entry
                .path()
                .metadata()
                .map_err(|e| Error::source(ErrorKind::Internal, e))?
                .permissions();
            fs::set_permissions(&target, perms).map_err(|e| Error::source(ErrorKind::Internal, e))?;
        } else {
            return Err(Error::custom(
                ErrorKind::UnsupportedEntryType,
                format!("`{}` is not a regular file or directory", entry.path().display()),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_missing_has_clear_message() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_output(dir.path(), "nonexistent").unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::OutputMissing);
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn output_subdir_cannot_escape_content_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_output(dir.path(), "../../etc").unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn output_subdir_rejects_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_output(dir.path(), "/etc").unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn copy_tree_is_byte_equal_to_source() {
        let src_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(src_dir.path().join("css")).unwrap();
        fs::write(src_dir.path().join("index.html"), "<h1>OK</h1>").unwrap();
        fs::write(src_dir.path().join("css/site.css"), "body{}").unwrap();

        let dest_dir = tempfile::tempdir().unwrap();
        let dest = dest_dir.path().join("slug");
        copy_tree(src_dir.path(), &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("index.html")).unwrap(), "<h1>OK</h1>");
        assert_eq!(fs::read_to_string(dest.join("css/site.css")).unwrap(), "body{}");
    }

    #[test]
    fn copy_tree_removes_old_destination_contents() {
        let src_dir = tempfile::tempdir().unwrap();
        fs::write(src_dir.path().join("new.html"), "new").unwrap();

        let dest_dir = tempfile::tempdir().unwrap();
        let dest = dest_dir.path().join("slug");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.html"), "stale").unwrap();

        copy_tree(src_dir.path(), &dest).unwrap();

        assert!(!dest.join("stale.html").exists());
        assert!(dest.join("new.html").exists());
    }
}
