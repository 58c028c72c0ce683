//! CLI surface (spec §6). Parsing lives outside the core: `Cli` is consumed
//! once in `main` and converted into the plain `Config` the orchestrator
//! depends on, so the loader/mux modules never import `clap`.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{CoreError, Result};
use crate::image::MAX_IMAGE_BYTES;
use crate::mode::Mode;

#[derive(Debug, Parser)]
#[command(
    name = "baseband-bootloader",
    about = "Upload a first-stage image to a GSM baseband target and multiplex its console/tool channels",
    version,
    disable_version_flag = true
)]
pub struct Cli {
    /// Print version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),

    /// UART device
    #[arg(short = 'p', long = "port", default_value = "/dev/ttyUSB1")]
    pub port: PathBuf,

    /// Loader dialect and image shape
    #[arg(short = 'm', long = "mode", default_value = "c123")]
    pub mode: Mode,

    /// L1A<->L23 tool socket path
    #[arg(short = 's', long = "l1a-socket", default_value = "/tmp/osmocom_l2")]
    pub l1a_socket: PathBuf,

    /// Loader tool socket path
    #[arg(short = 'l', long = "loader-socket", default_value = "/tmp/osmocom_loader")]
    pub loader_socket: PathBuf,

    /// Path to the image file to upload
    pub image: PathBuf,
}

/// Fully resolved, validated configuration the orchestrator is built from.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: PathBuf,
    pub mode: Mode,
    pub l1a_socket: PathBuf,
    pub loader_socket: PathBuf,
    pub image: PathBuf,
}

impl Config {
    /// Validates the image size cap (spec §6, §8 scenario 6) before any
    /// UART or socket is touched.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let len = image_len(&cli.image)?;
        if len > MAX_IMAGE_BYTES {
            return Err(CoreError::Config(format!(
                "{:?} is {} bytes, exceeding the {}-byte cap",
                cli.image, len, MAX_IMAGE_BYTES
            )));
        }

        Ok(Config {
            port: cli.port,
            mode: cli.mode,
            l1a_socket: cli.l1a_socket,
            loader_socket: cli.loader_socket,
            image: cli.image,
        })
    }
}

fn image_len(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| CoreError::Config(format!("cannot stat {:?}: {e}", path)))
}
