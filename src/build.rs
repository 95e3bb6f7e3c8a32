//! C4: thin coordinator that prepares a build-container spec for C2 and
//! interprets the result. Skipped entirely when the build command is
//! empty, per spec §4.4.

use std::path::Path;

use tokio::io::AsyncWrite;

use crate::error::Error;
use crate::model::EnvVars;
use crate::runtime::{BuildSpec, RuntimeAdapter};

pub const DEFAULT_BUILD_IMAGE: &str = "node:20-alpine";

/// Runs `build_command` inside an ephemeral container bind-mounting
/// `workdir` at `/workspace`. Returns `Ok(())` on exit code zero,
/// `Err(Error::build_failed(code))` on a non-zero exit — an ordinary
/// pipeline outcome, not an orchestration fault — and propagates any other
/// error from the runtime adapter unchanged.
pub async fn run_build<W>(
    runtime: &RuntimeAdapter,
    slug: &crate::model::Slug,
    workdir: &Path,
    build_command: &str,
    env: &EnvVars,
    build_image: &str,
    sink: W,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send,
{
    let (uid, gid) = RuntimeAdapter::uid_gid_of_current_process();

    let exit_code = runtime
        .run_build_container(
            BuildSpec {
                slug: slug.clone(),
                host_workdir: workdir.to_path_buf(),
                image: build_image.to_string(),
                command: build_command.to_string(),
                env: env.clone(),
                uid,
                gid,
            },
            sink,
        )
        .await?;

    if exit_code == 0 {
        Ok(())
    } else {
        Err(Error::build_failed(exit_code))
    }
}

pub fn should_run(build_command: &str) -> bool {
    !build_command.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_build_command_is_skipped() {
        assert!(!should_run(""));
        assert!(!should_run("   "));
    }

    #[test]
    fn non_empty_build_command_runs() {
        assert!(should_run("npm run build"));
    }
}
