pub mod memory;
pub mod pinecone;

pub use memory::{cosine_similarity, InMemoryVectorIndex};
pub use pinecone::PineconeIndex;
