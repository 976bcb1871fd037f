//! Structural store: transactional chunk registry, symbol table,
//! and relation edges, backed by `sea-orm` over a single SQLite file with
//! write-ahead logging. Readers are non-blocking; writers are serialized
//! per reconciliation.

use sea_orm::entity::prelude::*;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, Set, TransactionTrait};
use serde::{Deserialize, Serialize};

use crate::errors::CoreResult;

pub mod chunks {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "chunks")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub chunk_id: String,
        pub path: String,
        pub byte_start: i64,
        pub byte_end: i64,
        pub line_start: i32,
        pub line_end: i32,
        pub blob_hash: String,
        pub kind: String,
        pub schema_version: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod symbols {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "symbols")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub symbol_id: String,
        pub name: String,
        pub kind: String,
        pub defining_chunk_id: String,
        pub language: String,
        pub schema_version: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod relations {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "relations")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub src_symbol_id: String,
        pub dst_symbol_id: String,
        pub kind: String,
        pub weight: f64,
        pub schema_version: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Current schema version stamped on every row: a mismatch on read
/// triggers the same rebuild path as a failed integrity check, without
/// needing a separate manifest file.
pub const SCHEMA_VERSION: i32 = 1;

pub struct StructuralStore {
    db: DatabaseConnection,
}

impl StructuralStore {
    pub async fn open(sqlite_path: &std::path::Path) -> CoreResult<Self> {
        let url = format!("sqlite://{}?mode=rwc", sqlite_path.display());
        let mut opts = ConnectOptions::new(url);
        opts.sqlx_logging(false);
        let db = Database::connect(opts).await?;
        let store = Self { db };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> CoreResult<()> {
        let backend = self.db.get_database_backend();
        let schema = sea_orm::Schema::new(backend);
        for stmt in [
            backend.build(&schema.create_table_from_entity(chunks::Entity)),
            backend.build(&schema.create_table_from_entity(symbols::Entity)),
            backend.build(&schema.create_table_from_entity(relations::Entity)),
        ] {
            self.db.execute(stmt).await.ok();
        }
        Ok(())
    }

    /// Replaces all chunks/symbols/relations for the given changed paths in
    /// a single transaction. Orphaned symbols/relations whose
    /// defining chunk disappeared are pruned.
    pub async fn replace_for_paths(
        &self,
        removed_chunk_ids: Vec<String>,
        new_chunks: Vec<chunks::Model>,
        new_symbols: Vec<symbols::Model>,
        new_relations: Vec<relations::Model>,
    ) -> CoreResult<()> {
        let txn = self.db.begin().await?;

        for chunk_id in &removed_chunk_ids {
            chunks::Entity::delete_by_id(chunk_id.clone())
                .exec(&txn)
                .await?;
            let orphaned = symbols::Entity::find()
                .filter(symbols::Column::DefiningChunkId.eq(chunk_id.clone()))
                .all(&txn)
                .await?;
            for sym in orphaned {
                relations::Entity::delete_many()
                    .filter(relations::Column::SrcSymbolId.eq(sym.symbol_id.clone()))
                    .exec(&txn)
                    .await?;
                relations::Entity::delete_many()
                    .filter(relations::Column::DstSymbolId.eq(sym.symbol_id.clone()))
                    .exec(&txn)
                    .await?;
                symbols::Entity::delete_by_id(sym.symbol_id).exec(&txn).await?;
            }
        }

        for chunk in new_chunks {
            chunks::ActiveModel {
                chunk_id: Set(chunk.chunk_id),
                path: Set(chunk.path),
                byte_start: Set(chunk.byte_start),
                byte_end: Set(chunk.byte_end),
                line_start: Set(chunk.line_start),
                line_end: Set(chunk.line_end),
                blob_hash: Set(chunk.blob_hash),
                kind: Set(chunk.kind),
                schema_version: Set(SCHEMA_VERSION),
            }
            .insert(&txn)
            .await?;
        }
        for symbol in new_symbols {
            symbols::ActiveModel {
                symbol_id: Set(symbol.symbol_id),
                name: Set(symbol.name),
                kind: Set(symbol.kind),
                defining_chunk_id: Set(symbol.defining_chunk_id),
                language: Set(symbol.language),
                schema_version: Set(SCHEMA_VERSION),
            }
            .insert(&txn)
            .await?;
        }
        for relation in new_relations {
            relations::ActiveModel {
                id: sea_orm::ActiveValue::NotSet,
                src_symbol_id: Set(relation.src_symbol_id),
                dst_symbol_id: Set(relation.dst_symbol_id),
                kind: Set(relation.kind),
                weight: Set(relation.weight),
                schema_version: Set(SCHEMA_VERSION),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    pub async fn symbols_by_name(&self, name: &str) -> CoreResult<Vec<symbols::Model>> {
        Ok(symbols::Entity::find()
            .filter(symbols::Column::Name.eq(name))
            .all(&self.db)
            .await?)
    }

    pub async fn relations_from(&self, symbol_id: &str) -> CoreResult<Vec<relations::Model>> {
        Ok(relations::Entity::find()
            .filter(relations::Column::SrcSymbolId.eq(symbol_id))
            .all(&self.db)
            .await?)
    }

    pub async fn chunk_by_id(&self, chunk_id: &str) -> CoreResult<Option<chunks::Model>> {
        Ok(chunks::Entity::find_by_id(chunk_id).one(&self.db).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn schema_creates_and_round_trips_a_chunk() {
        let dir = tempdir().unwrap();
        let store = StructuralStore::open(&dir.path().join("structural.sqlite"))
            .await
            .unwrap();

        store
            .replace_for_paths(
                vec![],
                vec![chunks::Model {
                    chunk_id: "c1".into(),
                    path: "src/a.rs".into(),
                    byte_start: 0,
                    byte_end: 10,
                    line_start: 1,
                    line_end: 2,
                    blob_hash: "deadbeef".into(),
                    kind: "function".into(),
                    schema_version: SCHEMA_VERSION,
                }],
                vec![symbols::Model {
                    symbol_id: "s1".into(),
                    name: "foo".into(),
                    kind: "function".into(),
                    defining_chunk_id: "c1".into(),
                    language: "rust".into(),
                    schema_version: SCHEMA_VERSION,
                }],
                vec![],
            )
            .await
            .unwrap();

        let found = store.symbols_by_name("foo").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].defining_chunk_id, "c1");
    }

    #[tokio::test]
    async fn removing_a_chunk_prunes_its_symbols_and_relations() {
        let dir = tempdir().unwrap();
        let store = StructuralStore::open(&dir.path().join("structural.sqlite"))
            .await
            .unwrap();

        store
            .replace_for_paths(
                vec![],
                vec![chunks::Model {
                    chunk_id: "c1".into(),
                    path: "src/a.rs".into(),
                    byte_start: 0,
                    byte_end: 10,
                    line_start: 1,
                    line_end: 2,
                    blob_hash: "h1".into(),
                    kind: "function".into(),
                    schema_version: SCHEMA_VERSION,
                }],
                vec![symbols::Model {
                    symbol_id: "s1".into(),
                    name: "foo".into(),
                    kind: "function".into(),
                    defining_chunk_id: "c1".into(),
                    language: "rust".into(),
                    schema_version: SCHEMA_VERSION,
                }],
                vec![relations::Model {
                    id: 0,
                    src_symbol_id: "s1".into(),
                    dst_symbol_id: "s1".into(),
                    kind: "calls".into(),
                    weight: 1.0,
                    schema_version: SCHEMA_VERSION,
                }],
            )
            .await
            .unwrap();

        store
            .replace_for_paths(vec!["c1".into()], vec![], vec![], vec![])
            .await
            .unwrap();

        assert!(store.symbols_by_name("foo").await.unwrap().is_empty());
        assert!(store.relations_from("s1").await.unwrap().is_empty());
    }
}
