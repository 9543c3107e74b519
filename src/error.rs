//! Error types for vkpace

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayerError {
    #[error("{0} handle is not tracked by the layer")]
    UntrackedHandle(&'static str),

    #[error("next layer did not expose {0}")]
    MissingEntryPoint(&'static str),

    #[error("no loader link info in the create-info chain")]
    MissingLoaderLink,

    #[error("presentation mode changed, swapchain must be recreated")]
    SurfaceOutOfDate,
}

pub type Result<T> = std::result::Result<T, LayerError>;

impl LayerError {
    /// Convert LayerError to the Vulkan result code reported to the host.
    ///
    /// Untracked handles map to ERROR_INITIALIZATION_FAILED: handles may have
    /// been created before the layer attached, and the host must see a
    /// recoverable error rather than a crash.
    pub fn to_vk_result(&self) -> ash::vk::Result {
        match self {
            LayerError::UntrackedHandle(_)
            | LayerError::MissingEntryPoint(_)
            | LayerError::MissingLoaderLink => ash::vk::Result::ERROR_INITIALIZATION_FAILED,
            LayerError::SurfaceOutOfDate => ash::vk::Result::ERROR_OUT_OF_DATE_KHR,
        }
    }
}
