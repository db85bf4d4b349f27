//! Pure derivations over a packet sequence
//!
//! None of these functions mutate their input; each one re-scans the full
//! slice it is given. Packet lists are bounded by one conversation turn, so
//! recomputing is cheaper than keeping incremental state in sync.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::models::{CitationMap, FileDescriptor, SearchDocument, ToolCallRecord};

use super::types::{Packet, PacketObj, PacketType, StreamingCitation};

/// Tool name recorded for internal search
pub const SEARCH_TOOL_NAME: &str = "run_search";
/// Tool name recorded for internet search
pub const INTERNET_SEARCH_TOOL_NAME: &str = "run_internet_search";
/// Tool name recorded for image generation
pub const IMAGE_GENERATION_TOOL_NAME: &str = "generate_image";

/// Packets sharing one `ind`
#[derive(Debug, Clone, PartialEq)]
pub struct PacketGroup<'a> {
    pub ind: i64,
    pub packets: Vec<&'a Packet>,
}

/// Rendering family of a single packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketFamily {
    /// Final answer text
    Chat,
    Search,
    ImageGeneration,
    CustomTool,
    Reasoning,
    Citation,
    /// Stream and section bookkeeping
    Control,
    /// Type tag unknown to this client; renders as nothing
    Unclassified,
}

/// Renderer chosen for a whole `ind` group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendererKind {
    Chat,
    Search,
    ImageGeneration,
    CustomTool,
    Reasoning,
    Citation,
}

/// Bucket packets by `ind`, ordered by ascending `ind`, arrival order within a bucket
pub fn group_by_ind(packets: &[Packet]) -> Vec<PacketGroup<'_>> {
    let mut groups: BTreeMap<i64, Vec<&Packet>> = BTreeMap::new();
    for packet in packets {
        groups.entry(packet.ind).or_default().push(packet);
    }
    groups
        .into_iter()
        .map(|(ind, packets)| PacketGroup { ind, packets })
        .collect()
}

/// Running answer text: message-start and message-delta content in order
pub fn text_content(packets: &[Packet]) -> String {
    let mut text = String::new();
    for packet in packets {
        match &packet.obj {
            PacketObj::MessageStart { content, .. } | PacketObj::MessageDelta { content } => {
                text.push_str(content)
            }
            _ => {}
        }
    }
    text
}

/// Reasoning text of every reasoning delta in order
pub fn reasoning_content(packets: &[Packet]) -> String {
    packets
        .iter()
        .filter_map(|packet| match &packet.obj {
            PacketObj::ReasoningDelta { reasoning } => Some(reasoning.as_str()),
            _ => None,
        })
        .collect()
}

/// Every citation of every citation delta, flattened in order
pub fn citations(packets: &[Packet]) -> Vec<StreamingCitation> {
    packets
        .iter()
        .filter_map(|packet| match &packet.obj {
            PacketObj::CitationDelta { citations } => Some(citations.iter().cloned()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Document id to citation number. A later citation of the same document wins.
pub fn citation_map(packets: &[Packet]) -> CitationMap {
    let mut map = CitationMap::new();
    for citation in citations(packets) {
        map.insert(citation.document_id, citation.citation_num);
    }
    map
}

/// A stop packet has arrived
pub fn is_streaming_complete(packets: &[Packet]) -> bool {
    packets
        .iter()
        .any(|packet| packet.packet_type() == PacketType::Stop)
}

/// The final answer (text or generated image) has begun
pub fn is_final_answer_coming(packets: &[Packet]) -> bool {
    packets.iter().any(|packet| {
        matches!(
            packet.packet_type(),
            PacketType::MessageStart | PacketType::ImageGenerationToolStart
        )
    })
}

/// The section opened by the message start has been closed
pub fn is_final_answer_complete(packets: &[Packet]) -> bool {
    let Some(start) = packets
        .iter()
        .find(|packet| packet.packet_type() == PacketType::MessageStart)
    else {
        return false;
    };
    packets
        .iter()
        .any(|packet| packet.packet_type() == PacketType::SectionEnd && packet.ind == start.ind)
}

/// Family of a single packet. Exhaustive over [`PacketType`].
pub fn packet_family(packet: &Packet) -> PacketFamily {
    match packet.packet_type() {
        PacketType::MessageStart | PacketType::MessageDelta | PacketType::MessageEnd => {
            PacketFamily::Chat
        }
        PacketType::SearchToolStart | PacketType::SearchToolDelta => PacketFamily::Search,
        PacketType::ImageGenerationToolStart | PacketType::ImageGenerationToolDelta => {
            PacketFamily::ImageGeneration
        }
        PacketType::CustomToolStart | PacketType::CustomToolDelta => PacketFamily::CustomTool,
        PacketType::ReasoningStart | PacketType::ReasoningDelta => PacketFamily::Reasoning,
        PacketType::CitationStart | PacketType::CitationDelta => PacketFamily::Citation,
        PacketType::Stop | PacketType::SectionEnd => PacketFamily::Control,
        PacketType::Unknown => PacketFamily::Unclassified,
    }
}

/// Whether the packet belongs to the tool / search / reasoning rendering family
pub fn is_tool_packet(packet: &Packet, include_section_end: bool) -> bool {
    match packet.packet_type() {
        PacketType::SearchToolStart
        | PacketType::SearchToolDelta
        | PacketType::CustomToolStart
        | PacketType::CustomToolDelta
        | PacketType::ReasoningStart
        | PacketType::ReasoningDelta => true,
        PacketType::SectionEnd => include_section_end,
        _ => false,
    }
}

/// Whether the packet opens content displayed as the final answer
pub fn is_display_packet(packet: &Packet) -> bool {
    matches!(
        packet.packet_type(),
        PacketType::MessageStart | PacketType::ImageGenerationToolStart
    )
}

/// Whether the packet opens a tool invocation shown with a building indicator
pub fn is_tool_start(packet: &Packet) -> bool {
    matches!(
        packet.packet_type(),
        PacketType::SearchToolStart
            | PacketType::ImageGenerationToolStart
            | PacketType::CustomToolStart
    )
}

/// Renderer for a group: the first packet with a renderable family decides.
/// Groups holding only control or unknown packets render as nothing.
pub fn renderer_for_group(group: &PacketGroup<'_>) -> Option<RendererKind> {
    group.packets.iter().find_map(|packet| match packet_family(packet) {
        PacketFamily::Chat => Some(RendererKind::Chat),
        PacketFamily::Search => Some(RendererKind::Search),
        PacketFamily::ImageGeneration => Some(RendererKind::ImageGeneration),
        PacketFamily::CustomTool => Some(RendererKind::CustomTool),
        PacketFamily::Reasoning => Some(RendererKind::Reasoning),
        PacketFamily::Citation => Some(RendererKind::Citation),
        PacketFamily::Control | PacketFamily::Unclassified => None,
    })
}

/// `(ind, renderer)` for every group in ascending `ind` order
pub fn render_groups(packets: &[Packet]) -> Vec<(i64, Option<RendererKind>)> {
    group_by_ind(packets)
        .iter()
        .map(|group| (group.ind, renderer_for_group(group)))
        .collect()
}

/// Retrieved documents: the latest search delta carrying documents, superseded
/// by the message start's final documents when present
pub fn documents(packets: &[Packet]) -> Vec<SearchDocument> {
    let mut found: Option<&Vec<SearchDocument>> = None;
    for packet in packets {
        match &packet.obj {
            PacketObj::SearchToolDelta {
                documents: Some(docs),
                ..
            } => found = Some(docs),
            PacketObj::MessageStart {
                final_documents: Some(docs),
                ..
            } => found = Some(docs),
            _ => {}
        }
    }
    found.cloned().unwrap_or_default()
}

/// Files produced while answering: generated images and custom tool files
pub fn files(packets: &[Packet]) -> Vec<FileDescriptor> {
    let mut files = Vec::new();
    for packet in packets {
        match &packet.obj {
            PacketObj::ImageGenerationToolDelta { images } => {
                files.extend(images.iter().map(|image| FileDescriptor::image(&image.file_id)));
            }
            PacketObj::CustomToolDelta {
                file_ids: Some(ids),
                response_type,
                ..
            } => {
                let image = response_type == "image";
                files.extend(ids.iter().map(|id| {
                    if image {
                        FileDescriptor::image(id)
                    } else {
                        FileDescriptor {
                            id: id.clone(),
                            file_type: crate::models::ChatFileType::Document,
                            name: None,
                        }
                    }
                }));
            }
            _ => {}
        }
    }
    files
}

/// The most recent tool invocation, with its result once reported
pub fn tool_call(packets: &[Packet]) -> Option<ToolCallRecord> {
    let mut current: Option<ToolCallRecord> = None;
    for packet in packets {
        match &packet.obj {
            PacketObj::SearchToolStart { is_internet_search } => {
                let name = if *is_internet_search {
                    INTERNET_SEARCH_TOOL_NAME
                } else {
                    SEARCH_TOOL_NAME
                };
                current = Some(ToolCallRecord::started(name));
            }
            PacketObj::SearchToolDelta { queries, documents } => {
                if let Some(record) = current.as_mut() {
                    if let Some(queries) = queries {
                        record.tool_args = serde_json::json!({ "queries": queries });
                    }
                    if let Some(docs) = documents {
                        record.tool_result =
                            Some(serde_json::to_value(docs).unwrap_or(Value::Null));
                    }
                }
            }
            PacketObj::ImageGenerationToolStart => {
                current = Some(ToolCallRecord::started(IMAGE_GENERATION_TOOL_NAME));
            }
            PacketObj::ImageGenerationToolDelta { images } => {
                if let Some(record) = current.as_mut() {
                    record.tool_result = Some(serde_json::to_value(images).unwrap_or(Value::Null));
                }
            }
            PacketObj::CustomToolStart { tool_name } => {
                current = Some(ToolCallRecord::started(tool_name.clone()));
            }
            PacketObj::CustomToolDelta {
                tool_name,
                data,
                file_ids,
                ..
            } => {
                let record = current.get_or_insert_with(|| ToolCallRecord::started(tool_name.clone()));
                record.tool_result = Some(match (data, file_ids) {
                    (Some(data), _) => data.clone(),
                    (None, Some(ids)) => serde_json::json!({ "file_ids": ids }),
                    (None, None) => Value::Null,
                });
            }
            _ => {}
        }
    }
    current
}

/// Highest `ind` in the sequence
pub fn max_ind(packets: &[Packet]) -> Option<i64> {
    packets.iter().map(|packet| packet.ind).max()
}

/// All node fields derived from a packet sequence
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DerivedFields {
    pub text: String,
    pub citations: CitationMap,
    pub documents: Vec<SearchDocument>,
    pub files: Vec<FileDescriptor>,
    pub tool_call: Option<ToolCallRecord>,
    pub generation_complete: bool,
}

/// Derive every cached field at once
pub fn derive(packets: &[Packet]) -> DerivedFields {
    DerivedFields {
        text: text_content(packets),
        citations: citation_map(packets),
        documents: documents(packets),
        files: files(packets),
        tool_call: tool_call(packets),
        generation_complete: is_final_answer_complete(packets) || is_streaming_complete(packets),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::types::GeneratedImage;

    fn citation_delta(ind: i64, pairs: &[(&str, u32)]) -> Packet {
        Packet::new(
            ind,
            PacketObj::CitationDelta {
                citations: pairs
                    .iter()
                    .map(|(doc, num)| StreamingCitation {
                        citation_num: *num,
                        document_id: doc.to_string(),
                    })
                    .collect(),
            },
        )
    }

    #[test]
    fn test_text_content_is_order_sensitive() {
        let forward = vec![Packet::message_delta(0, "a"), Packet::message_delta(0, "b")];
        let reverse = vec![Packet::message_delta(0, "b"), Packet::message_delta(0, "a")];
        assert_eq!(text_content(&forward), "ab");
        assert_eq!(text_content(&reverse), "ba");
    }

    #[test]
    fn test_text_content_includes_message_start() {
        let packets = vec![
            Packet::new(0, PacketObj::ReasoningDelta { reasoning: "hmm".into() }),
            Packet::message_start(1, "Hello"),
            Packet::message_delta(1, ", world"),
        ];
        assert_eq!(text_content(&packets), "Hello, world");
        assert_eq!(reasoning_content(&packets), "hmm");
    }

    #[test]
    fn test_group_by_ind_orders_ascending() {
        let packets = vec![
            Packet::message_start(3, "x"),
            Packet::new(1, PacketObj::ReasoningStart),
            Packet::message_delta(3, "y"),
            Packet::new(1, PacketObj::ReasoningDelta { reasoning: "r".into() }),
        ];
        let groups = group_by_ind(&packets);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].ind, 1);
        assert_eq!(groups[0].packets.len(), 2);
        assert_eq!(groups[1].ind, 3);
        assert_eq!(groups[1].packets[1], &packets[2]);
    }

    #[test]
    fn test_citation_map_last_write_wins() {
        let packets = vec![
            citation_delta(2, &[("doc-a", 1), ("doc-b", 2)]),
            citation_delta(2, &[("doc-a", 3)]),
        ];
        assert_eq!(citations(&packets).len(), 3);
        let map = citation_map(&packets);
        assert_eq!(map.get("doc-a"), Some(&3));
        assert_eq!(map.get("doc-b"), Some(&2));
    }

    #[test]
    fn test_completion_predicates() {
        let mut packets = vec![Packet::new(0, PacketObj::SearchToolStart { is_internet_search: false })];
        assert!(!is_final_answer_coming(&packets));
        assert!(!is_final_answer_complete(&packets));

        packets.push(Packet::section_end(0));
        packets.push(Packet::message_start(1, "answer"));
        assert!(is_final_answer_coming(&packets));
        assert!(!is_final_answer_complete(&packets));

        packets.push(Packet::section_end(1));
        assert!(is_final_answer_complete(&packets));
        assert!(!is_streaming_complete(&packets));

        packets.push(Packet::stop(2));
        assert!(is_streaming_complete(&packets));
    }

    #[test]
    fn test_image_start_counts_as_final_answer() {
        let packets = vec![Packet::new(0, PacketObj::ImageGenerationToolStart)];
        assert!(is_final_answer_coming(&packets));
        assert!(is_display_packet(&packets[0]));
    }

    #[test]
    fn test_tool_classification() {
        let reasoning = Packet::new(0, PacketObj::ReasoningStart);
        let section_end = Packet::section_end(0);
        let message = Packet::message_start(1, "");
        assert!(is_tool_packet(&reasoning, false));
        assert!(is_tool_packet(&section_end, true));
        assert!(!is_tool_packet(&section_end, false));
        assert!(!is_tool_packet(&message, true));
        assert_eq!(packet_family(&Packet::new(0, PacketObj::Unknown)), PacketFamily::Unclassified);
    }

    #[test]
    fn test_render_groups_skips_unknown() {
        let packets = vec![
            Packet::new(0, PacketObj::Unknown),
            Packet::new(1, PacketObj::CustomToolStart { tool_name: "weather".into() }),
            Packet::message_start(2, "hi"),
            Packet::stop(3),
        ];
        assert_eq!(
            render_groups(&packets),
            vec![
                (0, None),
                (1, Some(RendererKind::CustomTool)),
                (2, Some(RendererKind::Chat)),
                (3, None),
            ]
        );
    }

    #[test]
    fn test_tool_call_tracks_result() {
        let mut packets = vec![Packet::new(0, PacketObj::CustomToolStart { tool_name: "weather".into() })];
        let record = tool_call(&packets).unwrap();
        assert_eq!(record.tool_name, "weather");
        assert!(record.is_unfinished());

        packets.push(Packet::new(
            0,
            PacketObj::CustomToolDelta {
                tool_name: "weather".into(),
                response_type: "json".into(),
                data: Some(serde_json::json!({"temp": 21})),
                file_ids: None,
            },
        ));
        let record = tool_call(&packets).unwrap();
        assert_eq!(record.tool_result, Some(serde_json::json!({"temp": 21})));
    }

    #[test]
    fn test_documents_and_files() {
        let doc = SearchDocument {
            document_id: "d1".into(),
            semantic_identifier: "Doc".into(),
            link: None,
            blurb: String::new(),
            source_type: "web".into(),
            score: None,
        };
        let packets = vec![
            Packet::new(
                0,
                PacketObj::SearchToolDelta {
                    queries: Some(vec!["q".into()]),
                    documents: Some(vec![doc.clone()]),
                },
            ),
            Packet::new(
                1,
                PacketObj::ImageGenerationToolDelta {
                    images: vec![GeneratedImage {
                        file_id: "img-1".into(),
                        url: String::new(),
                        revised_prompt: String::new(),
                    }],
                },
            ),
        ];
        assert_eq!(documents(&packets), vec![doc]);
        assert_eq!(files(&packets), vec![FileDescriptor::image("img-1")]);
        assert_eq!(max_ind(&packets), Some(1));
        assert_eq!(max_ind(&[]), None);
    }
}
