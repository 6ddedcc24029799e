use sqlx::PgPool;

/// Runs read queries against the pool.
///
/// Each query is a request struct with a
/// `kanau::processor::Processor<Query> for DatabaseProcessor` impl. Writes
/// that must share a transaction are `*_tx` associated functions on the
/// entity instead.
#[derive(Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}

impl DatabaseProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
