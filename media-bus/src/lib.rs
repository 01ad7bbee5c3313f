/// Initializes the multimedia framework. Call once at startup before any
/// pipeline is created. A no-op when only the in-process backend is compiled.
pub fn init() -> anyhow::Result<()> {
    #[cfg(feature = "gstreamer")]
    gstreamer::init().map_err(|e| anyhow::anyhow!("gstreamer init: {}", e))?;
    Ok(())
}

pub mod backend;
pub mod bins;
pub mod element;
pub mod error;
pub mod graph;
pub mod preview;
pub mod profile;
pub mod session;
