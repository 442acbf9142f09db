//! The runtime interface emulator binary and the image build context that
//! layers it on top of a language runtime base image.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use data_model::Architecture;
use tracing::{debug, info};

const RIE_AMD64_URL: &str = "https://github.com/aws/aws-lambda-runtime-interface-emulator/releases/latest/download/aws-lambda-rie";
const RIE_ARM64_URL: &str = "https://github.com/aws/aws-lambda-runtime-interface-emulator/releases/latest/download/aws-lambda-rie-arm64";

/// File name of the emulator inside the build context.
const RIE_FILE_NAME: &str = "aws-lambda-rie";

/// Where the emulator ends up inside the image.
pub(crate) const RIE_CONTAINER_PATH: &str = "/var/aws-lambda-rie";

fn download_url(architecture: Architecture) -> &'static str {
    match architecture {
        Architecture::X86_64 => RIE_AMD64_URL,
        Architecture::Arm64 => RIE_ARM64_URL,
    }
}

/// Tag of the sandbox image for a runtime/architecture pair.
pub fn image_name(runtime: &str, architecture: Architecture) -> String {
    format!(
        "lambda-local-runner-{}-{}:latest",
        runtime.to_lowercase(),
        architecture
    )
}

pub(crate) fn dockerfile(runtime: &str) -> String {
    format!(
        "FROM public.ecr.aws/sam/emulation-{}:latest\n\nCOPY {} {}\n",
        runtime.to_lowercase(),
        RIE_FILE_NAME,
        RIE_CONTAINER_PATH
    )
}

/// In-memory tar archive holding the Dockerfile and the emulator binary.
pub(crate) fn build_context(runtime: &str, emulator: &[u8]) -> Result<Vec<u8>> {
    let docker_file = dockerfile(runtime);
    let mut tar = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(docker_file.len() as u64);
    header.set_mode(0o644);
    tar.append_data(&mut header, "Dockerfile", docker_file.as_bytes())
        .context("writing Dockerfile to build context")?;

    let mut header = tar::Header::new_gnu();
    header.set_size(emulator.len() as u64);
    header.set_mode(0o755);
    tar.append_data(&mut header, RIE_FILE_NAME, emulator)
        .context("writing emulator to build context")?;

    tar.into_inner().context("finishing build context")
}

/// Returns the emulator for `architecture`, downloading it into `cache_dir`
/// the first time.
pub(crate) async fn fetch(
    client: &reqwest::Client,
    cache_dir: &Path,
    architecture: Architecture,
) -> Result<PathBuf> {
    fetch_from(client, download_url(architecture), cache_dir, architecture).await
}

async fn fetch_from(
    client: &reqwest::Client,
    url: &str,
    cache_dir: &Path,
    architecture: Architecture,
) -> Result<PathBuf> {
    let cache_location = cache_dir.join(format!("{}-{}", RIE_FILE_NAME, architecture));

    match tokio::fs::metadata(&cache_location).await {
        Ok(meta) if meta.is_file() => {
            debug!(dest = %cache_location.display(), "cached emulator found");
            return Ok(cache_location);
        }
        Ok(_) => bail!(
            "emulator cache location {} is not a file",
            cache_location.display()
        ),
        Err(_) => {}
    }

    info!(src = url, dest = %cache_location.display(), "downloading runtime interface emulator");
    tokio::fs::create_dir_all(cache_dir)
        .await
        .with_context(|| format!("creating cache dir {}", cache_dir.display()))?;

    let resp = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("fetching {}", url))?;
    let contents = resp.bytes().await.context("reading emulator download")?;

    // Every download gets its own file; the rename into place is atomic, so
    // concurrent fetches of one architecture leave a complete binary.
    let partial = tempfile::Builder::new()
        .prefix(&format!("{}-{}.", RIE_FILE_NAME, architecture))
        .suffix(".partial")
        .tempfile_in(cache_dir)
        .with_context(|| format!("creating download file in {}", cache_dir.display()))?
        .into_temp_path();
    tokio::fs::write(&partial, &contents)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    partial
        .persist(&cache_location)
        .with_context(|| format!("moving emulator into {}", cache_location.display()))?;

    Ok(cache_location)
}
