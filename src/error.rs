/// Failures that stop the simulation from starting or running.
///
/// None of these are retryable: they are either an unsupported platform or a
/// bug in the shaders or resource layout.
#[derive(Debug, thiserror::Error)]
pub enum LifeError {
    #[error("GPU capability missing: {0}")]
    Capability(String),

    #[error("failed to create {what}: {message}")]
    ResourceCreation { what: &'static str, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read back cell state: {0}")]
    Readback(String),

    #[error(transparent)]
    RequestAdapter(#[from] wgpu::RequestAdapterError),

    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error(transparent)]
    CreateSurface(#[from] wgpu::CreateSurfaceError),

    #[error(transparent)]
    Poll(#[from] wgpu::PollError),
}
