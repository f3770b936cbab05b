use crate::{
    db::Db,
    error::Error,
    expr::{ExprBuilder, QueryError},
    instance::Instance,
    key::{self, KeyCodec},
    schema::EntityDef,
    store::{Item, QueryInput, Scalar},
};
use futures::stream::{Stream, try_unfold};
use std::sync::Arc;
use tracing::debug;

/// Backend name of the synthetic iteration index.
const ITER_INDEX: &str = "iter";

#[derive(Clone, Debug)]
struct IterState {
    bucket: u32,
    end_bucket: u32,
    start_key: Option<Item>,
}

#[derive(Clone, Debug)]
enum Cursor {
    Start,
    At(IterState),
    Done,
}

impl Db {
    /// Lazily traverse every record of an iterable entity, in batches,
    /// across all buckets. Finite: the stream ends after the last bucket's
    /// last page. Consumers that stop pulling stop the paging.
    pub fn iterate_all(
        &self,
        entity: &str,
        batch_size: u32,
    ) -> impl Stream<Item = Result<Vec<Arc<Instance>>, Error>> + Send + use<> {
        self.iterate_range(entity.to_string(), None, batch_size)
    }

    /// Lazily traverse a single bucket; callers fan buckets out across
    /// their own tasks for parallel traversal.
    pub fn iterate_bucket(
        &self,
        entity: &str,
        bucket: u32,
        batch_size: u32,
    ) -> impl Stream<Item = Result<Vec<Arc<Instance>>, Error>> + Send + use<> {
        self.iterate_range(entity.to_string(), Some(bucket), batch_size)
    }

    fn iterate_range(
        &self,
        entity: String,
        only_bucket: Option<u32>,
        batch_size: u32,
    ) -> impl Stream<Item = Result<Vec<Arc<Instance>>, Error>> + Send + use<> {
        let db = self.clone();

        try_unfold(Cursor::Start, move |cursor| {
            let db = db.clone();
            let entity = entity.clone();

            async move {
                let entity_def = db.inner.registry.entity(&entity)?;
                if !entity_def.iteration.iterable {
                    return Err(Error::Query(QueryError::NotIterable {
                        entity: entity_def.name.clone(),
                    }));
                }

                let mut state = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::At(state) => state,
                    Cursor::Start => {
                        let buckets = entity_def.iteration.buckets;
                        let (first, last) = match only_bucket {
                            Some(bucket) => {
                                if bucket >= buckets {
                                    return Err(Error::Query(QueryError::BucketOutOfRange {
                                        entity: entity_def.name.clone(),
                                        bucket,
                                    }));
                                }
                                (bucket, bucket)
                            }
                            None => (0, buckets - 1),
                        };
                        IterState {
                            bucket: first,
                            end_bucket: last,
                            start_key: None,
                        }
                    }
                };

                loop {
                    let (batch, next_key) = db
                        .iter_page(&entity_def, state.bucket, batch_size, state.start_key.take())
                        .await?;

                    let next = match next_key {
                        Some(next_key) => Cursor::At(IterState {
                            start_key: Some(next_key),
                            ..state.clone()
                        }),
                        None if state.bucket < state.end_bucket => Cursor::At(IterState {
                            bucket: state.bucket + 1,
                            end_bucket: state.end_bucket,
                            start_key: None,
                        }),
                        None => Cursor::Done,
                    };

                    if !batch.is_empty() {
                        return Ok(Some((batch, next)));
                    }
                    match next {
                        Cursor::Done => return Ok(None),
                        Cursor::At(next) => state = next,
                        Cursor::Start => unreachable!("iteration never rewinds"),
                    }
                }
            }
        })
    }

    /// One page of one bucket on the synthetic iteration index. The index
    /// projects key attributes only; instances materialize sparse and can
    /// be re-fetched for full data.
    async fn iter_page(
        &self,
        entity_def: &Arc<EntityDef>,
        bucket: u32,
        batch_size: u32,
        start_key: Option<Item>,
    ) -> Result<(Vec<Arc<Instance>>, Option<Item>), Error> {
        let tenant = self.tenant_for("iterate")?;
        let codec = KeyCodec::new(entity_def, &tenant);

        let mut builder = ExprBuilder::new();
        let pk_name = builder.bind_name(key::ATTR_ITER_PK);
        let pk_value = builder.bind_value(Scalar::S(codec.iter_pk(bucket)));
        let key_condition = format!("{pk_name} = {pk_value}");
        let (names, values) = builder.into_parts();

        let output = self
            .inner
            .store
            .query(QueryInput {
                table: self.table().to_string(),
                index_name: Some(ITER_INDEX.to_string()),
                key_condition,
                filter: None,
                names,
                values,
                limit: Some(batch_size.max(1)),
                exclusive_start_key: start_key,
                reverse: false,
                count_only: false,
                return_consumed_capacity: true,
            })
            .await?;

        debug!(
            entity = %entity_def.name,
            bucket,
            page = output.items.len(),
            "iterate page"
        );

        let mut batch = Vec::with_capacity(output.items.len());
        for item in output.items {
            let pk = item
                .get(key::ATTR_PK)
                .and_then(Scalar::as_str)
                .ok_or(crate::key::DataFormatError::MissingReservedAttr { attr: key::ATTR_PK })?;
            let sk = item
                .get(key::ATTR_SK)
                .and_then(Scalar::as_str)
                .ok_or(crate::key::DataFormatError::MissingReservedAttr { attr: key::ATTR_SK })?;
            let id = codec.parse_primary(pk, sk)?;
            batch.push(Arc::new(Instance::materialize(
                entity_def.clone(),
                id,
                item,
            )?));
        }

        Ok((batch, output.last_evaluated_key))
    }
}
