/// Protocol-buffer messages served to the browser.
///
/// Hand-written `prost` derives; there is no .proto build step.

/// One label bundle (`L<b>.pb`): the label frames of one image bundle.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelBundle {
    #[prost(uint32, tag = "1")]
    pub tile_width: u32,
    #[prost(uint32, tag = "2")]
    pub tile_height: u32,
    #[prost(message, repeated, tag = "3")]
    pub frames: ::prost::alloc::vec::Vec<LabelFrame>,
}

/// Labels of one frame, run-length encoded in raster order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelFrame {
    /// Frame index within the whole stack (0-based).
    #[prost(uint32, tag = "1")]
    pub frame: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub run_labels: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub run_lengths: ::prost::alloc::vec::Vec<u32>,
}

/// Column-major track table (`massOverTime.pb`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackTable {
    #[prost(message, repeated, tag = "1")]
    pub columns: ::prost::alloc::vec::Vec<TrackColumn>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackColumn {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(double, repeated, tag = "2")]
    pub values: ::prost::alloc::vec::Vec<f64>,
}
