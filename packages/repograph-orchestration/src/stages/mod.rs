// Stage implementations
pub mod filesystem;
pub mod summarization;

// Re-exports
pub use filesystem::{FilesystemStage, FILESYSTEM_STAGE};
pub use summarization::{
    ContentExtractor, FileContentExtractor, SummarizationStage, TextGenerator,
    SUMMARIZATION_STAGE,
};

use crate::pipeline::Stage;
use crate::registry::StageRegistry;
use repograph_store::GraphStore;
use std::sync::Arc;

/// Register the filesystem and summarization stages against one store
pub fn register_builtin(
    registry: &mut StageRegistry,
    store: Arc<dyn GraphStore>,
    generator: Arc<dyn TextGenerator>,
) -> &mut StageRegistry {
    let walk_store = store.clone();
    registry.register(FILESYSTEM_STAGE, move |_| {
        Ok(Arc::new(FilesystemStage::new(walk_store.clone())) as Arc<dyn Stage>)
    });
    registry.register(SUMMARIZATION_STAGE, move |env| {
        let config = &env.config.summarization;
        let extractor = Arc::new(FileContentExtractor::new(config.max_content_bytes));
        Ok(Arc::new(SummarizationStage::new(
            store.clone(),
            generator.clone(),
            extractor,
            env.throttle.clone(),
            config,
        )) as Arc<dyn Stage>)
    });
    registry
}
