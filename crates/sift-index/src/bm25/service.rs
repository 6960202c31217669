//! BM25 actor service.
//!
//! A single Tokio task owns one [`Bm25Index`] per collection and serializes
//! all mutation, so retrieval tasks never contend on locks. Commands arrive
//! over `mpsc`; queries answer over `oneshot`.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use super::{Bm25Index, Bm25Params};

/// Lifecycle of the sparse index for one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bm25Status {
    /// No documents have ever been indexed for the collection.
    Uninitialized,
    /// The collection was indexed but currently holds no documents.
    Empty,
    Ready { docs: usize },
}

#[derive(Debug)]
pub enum Bm25Cmd {
    AddBatch {
        collection: String,
        docs: Vec<(String, String)>,
    },
    Remove {
        collection: String,
        ids: Vec<String>,
    },
    /// Drop a collection's index entirely.
    RemoveCollection {
        collection: String,
    },
    Search {
        collection: String,
        query: String,
        top_k: usize,
        resp: oneshot::Sender<Vec<(String, f32)>>,
    },
    Size {
        collection: String,
        resp: oneshot::Sender<usize>,
    },
    Status {
        collection: String,
        resp: oneshot::Sender<Bm25Status>,
    },
}

/// Start the BM25 service actor with explicit parameters.
/// Returns an `mpsc::Sender<Bm25Cmd>` handle for issuing commands.
pub fn start(params: Bm25Params) -> mpsc::Sender<Bm25Cmd> {
    let (tx, mut rx) = mpsc::channel::<Bm25Cmd>(128);
    let mut indexes: HashMap<String, Bm25Index> = HashMap::new();

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Bm25Cmd::AddBatch { collection, docs } => {
                    tracing::debug!(collection = %collection, docs = docs.len(), "BM25 AddBatch");
                    let index = indexes
                        .entry(collection)
                        .or_insert_with(|| Bm25Index::with_params(params));
                    index.add_batch(docs);
                }
                Bm25Cmd::Remove { collection, ids } => {
                    tracing::debug!(collection = %collection, ids = ids.len(), "BM25 Remove");
                    if let Some(index) = indexes.get_mut(&collection) {
                        for id in ids {
                            index.remove(&id);
                        }
                    }
                }
                Bm25Cmd::RemoveCollection { collection } => {
                    tracing::debug!(collection = %collection, "BM25 RemoveCollection");
                    if let Some(mut index) = indexes.remove(&collection) {
                        index.clear();
                    }
                }
                Bm25Cmd::Search {
                    collection,
                    query,
                    top_k,
                    resp,
                } => {
                    let results = indexes
                        .get(&collection)
                        .map(|index| index.search(&query, top_k))
                        .unwrap_or_default();
                    let _ = resp.send(results);
                }
                Bm25Cmd::Size { collection, resp } => {
                    let _ = resp.send(indexes.get(&collection).map_or(0, Bm25Index::size));
                }
                Bm25Cmd::Status { collection, resp } => {
                    let status = match indexes.get(&collection) {
                        None => Bm25Status::Uninitialized,
                        Some(index) if index.size() == 0 => Bm25Status::Empty,
                        Some(index) => Bm25Status::Ready { docs: index.size() },
                    };
                    let _ = resp.send(status);
                }
            }
        }
        tracing::info!("BM25 service actor loop ended");
    });

    tx
}

/// Convenience starter with default Okapi parameters.
pub fn start_default() -> mpsc::Sender<Bm25Cmd> {
    start(Bm25Params::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn search(
        tx: &mpsc::Sender<Bm25Cmd>,
        collection: &str,
        query: &str,
    ) -> Vec<(String, f32)> {
        let (resp, rx) = oneshot::channel();
        tx.send(Bm25Cmd::Search {
            collection: collection.to_string(),
            query: query.to_string(),
            top_k: 10,
            resp,
        })
        .await
        .expect("actor alive");
        rx.await.expect("actor replied")
    }

    #[tokio::test]
    async fn actor_indexes_and_searches_per_collection() {
        let tx = start_default();
        tx.send(Bm25Cmd::AddBatch {
            collection: "kb".to_string(),
            docs: vec![
                ("d1".to_string(), "rust ownership borrowing".to_string()),
                ("d2".to_string(), "python garbage collection".to_string()),
            ],
        })
        .await
        .unwrap();

        let hits = search(&tx, "kb", "ownership").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "d1");

        // An unknown collection answers empty, not an error.
        assert!(search(&tx, "nope", "ownership").await.is_empty());
    }

    #[tokio::test]
    async fn actor_status_lifecycle() {
        let tx = start_default();

        let (resp, rx) = oneshot::channel();
        tx.send(Bm25Cmd::Status {
            collection: "kb".to_string(),
            resp,
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), Bm25Status::Uninitialized);

        tx.send(Bm25Cmd::AddBatch {
            collection: "kb".to_string(),
            docs: vec![("d1".to_string(), "some text here".to_string())],
        })
        .await
        .unwrap();
        let (resp, rx) = oneshot::channel();
        tx.send(Bm25Cmd::Status {
            collection: "kb".to_string(),
            resp,
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), Bm25Status::Ready { docs: 1 });

        tx.send(Bm25Cmd::Remove {
            collection: "kb".to_string(),
            ids: vec!["d1".to_string()],
        })
        .await
        .unwrap();
        let (resp, rx) = oneshot::channel();
        tx.send(Bm25Cmd::Status {
            collection: "kb".to_string(),
            resp,
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), Bm25Status::Empty);
    }
}
