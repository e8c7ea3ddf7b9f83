/// Encodings an engine can build a compiled model from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelFormat {
    /// JSON graph document understood by the reference engine.
    Graph,
    /// Serialized compiled graph exported by the reference engine.
    GraphCache,
    Onnx,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PerformanceMode {
    #[default]
    None,
    Low,
    Medium,
    High,
    Extreme,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    None,
    Low,
    Medium,
    High,
}

/// Caller preferences supplied with a model at prepare time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelConfig {
    pub enable_float16: bool,
    pub performance_mode: PerformanceMode,
    pub priority: Priority,
}
