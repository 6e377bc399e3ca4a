use pdf_chat_core::{InMemoryVectorIndex, Passage, PassageMetadata, VectorIndex};
use proptest::prelude::*;

fn passages(count: usize) -> Vec<Passage> {
    (0..count)
        .map(|ordinal| Passage {
            text: format!("passage {ordinal}"),
            metadata: PassageMetadata {
                doc_id: "doc".to_string(),
                page: 1,
                ordinal: ordinal as u64,
            },
        })
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

proptest! {
    #[test]
    fn search_returns_at_most_k_hits_in_descending_score_order(
        vectors in proptest::collection::vec(
            proptest::collection::vec(-1.0f32..1.0, 3),
            1..20,
        ),
        query in proptest::collection::vec(-1.0f32..1.0, 3),
        k in 1usize..10,
    ) {
        let hits = runtime().block_on(async {
            let index = InMemoryVectorIndex::new(3);
            index
                .build_namespace("doc", &passages(vectors.len()), &vectors)
                .await
                .expect("build");
            index.search("doc", &query, k).await.expect("search")
        });

        prop_assert!(hits.len() <= k);
        prop_assert_eq!(hits.len(), k.min(vectors.len()));
        for pair in hits.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
        }
        for hit in &hits {
            prop_assert_eq!(&hit.passage.metadata.doc_id, "doc");
        }
    }
}
