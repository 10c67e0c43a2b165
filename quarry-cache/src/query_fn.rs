//! Async producers for queries and mutations.

use crate::signal::AbortSignal;
use async_trait::async_trait;
use quarry_core::{QueryKey, QueryResult};
use std::future::Future;

/// Context handed to a query function on every attempt.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub key: QueryKey,
    /// Zero for the first call, incremented for each retry.
    pub attempt: u32,
    /// Flagged when the fetch is cancelled or superseded.
    pub signal: AbortSignal,
}

/// Produces the data for a query.
///
/// Must be callable again after a failure; the retry loop invokes it once
/// per attempt. Closures `Fn(QueryContext) -> impl Future` implement it.
#[async_trait]
pub trait QueryFn<T>: Send + Sync + 'static {
    async fn call(&self, ctx: QueryContext) -> QueryResult<T>;
}

#[async_trait]
impl<T, F, Fut> QueryFn<T> for F
where
    T: Send + 'static,
    F: Fn(QueryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryResult<T>> + Send + 'static,
{
    async fn call(&self, ctx: QueryContext) -> QueryResult<T> {
        (self)(ctx).await
    }
}

/// Performs a write-style operation for a [`crate::Mutation`].
#[async_trait]
pub trait MutationFn<V, T>: Send + Sync + 'static {
    async fn call(&self, variables: V) -> QueryResult<T>;
}

#[async_trait]
impl<V, T, F, Fut> MutationFn<V, T> for F
where
    V: Send + 'static,
    T: Send + 'static,
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryResult<T>> + Send + 'static,
{
    async fn call(&self, variables: V) -> QueryResult<T> {
        (self)(variables).await
    }
}
