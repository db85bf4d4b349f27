//! Streamed packet protocol and the reducer folding it into node fields

pub mod reducer;
pub mod types;

pub use reducer::{
    citation_map, citations, derive, documents, files, group_by_ind, is_display_packet,
    is_final_answer_complete, is_final_answer_coming, is_streaming_complete, is_tool_packet,
    is_tool_start, max_ind, packet_family, reasoning_content, render_groups, renderer_for_group,
    text_content, tool_call, DerivedFields, PacketFamily, PacketGroup, RendererKind,
};
pub use types::{
    GeneratedImage, MessageResponseIds, Packet, PacketObj, PacketType, StopReason, StreamItem,
    StreamStopInfo, StreamingCitation, StreamingError,
};
