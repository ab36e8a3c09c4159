use std::sync::Arc;
use std::time::Duration;

use mnn_bridge::reference::ModelBuilder;
use mnn_bridge::NativeApi;

pub fn api() -> Arc<NativeApi> {
    Arc::new(NativeApi::reference())
}

/// Image classifier shaped model: 1x3x224x224 in, 1x1000 out.
#[allow(dead_code)]
pub fn classifier() -> ModelBuilder {
    ModelBuilder::new()
        .biz_code("classify")
        .uuid("5f1c2a9e-classifier")
        .input("data", &[1, 3, 224, 224])
        .output("prob", &[1, 1000])
        .op("conv1", "Convolution", 118.0)
        .op("relu1", "ReLU", 0.8)
        .op("fc", "InnerProduct", 2.0)
}

/// Two operators with a simulated run time.
#[allow(dead_code)]
pub fn slow_model(latency: Duration) -> ModelBuilder {
    ModelBuilder::new()
        .latency(latency)
        .input("x", &[1, 4])
        .output("y", &[1, 2])
        .op("a", "ReLU", 0.0)
        .op("b", "Softmax", 0.0)
}
