use std::sync::Arc;

use gpuctl_core::metrics::gpu::GpuSource;
use gpuctl_core::Controller;

#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
    pub gpu_source: Arc<dyn GpuSource>,
}
