//! The canonical processor set.

pub mod activity_monitor;
pub mod assistant_assembler;
pub mod audio_splitter;
pub mod context_aggregator;
pub mod llm;
pub mod mute_filter;
pub mod realtime_pacer;
pub mod sentence_assembler;

pub use activity_monitor::ActivityMonitor;
pub use assistant_assembler::AssistantAssembler;
pub use audio_splitter::AudioSplitter;
pub use context_aggregator::ContextAggregator;
pub use llm::LlmProcessor;
pub use mute_filter::MuteFilter;
pub use realtime_pacer::RealtimePacer;
pub use sentence_assembler::SentenceAssembler;
