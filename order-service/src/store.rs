//! Storage gateway over the four order tables.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

/// Result of a successful aggregate write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All four parts were committed.
    Inserted,
    /// An order with the same uid already exists; nothing was written.
    Duplicate,
}

/// Receives rows from [`OrderStore::scan_orders`] one at a time.
pub type OrderSink<'a> = dyn FnMut(Order) + Send + 'a;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists an aggregate atomically. Either every row is committed or none is.
    async fn write_aggregate(&self, aggregate: &OrderAggregate) -> Result<WriteOutcome, StoreError>;

    async fn read_order(&self, order_uid: &str) -> Result<Order, StoreError>;

    async fn read_delivery(&self, order_uid: &str) -> Result<Delivery, StoreError>;

    async fn read_payment(&self, order_uid: &str) -> Result<Payment, StoreError>;

    /// Returns the items of an order in insertion order, possibly none.
    async fn read_items(&self, order_uid: &str) -> Result<Vec<Item>, StoreError>;

    /// Streams every order row into `sink` and returns how many were visited.
    async fn scan_orders(&self, sink: &mut OrderSink<'_>) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn write_aggregate(&self, aggregate: &OrderAggregate) -> Result<WriteOutcome, StoreError> {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        let aggregate = aggregate.clone();
        let order_uid = aggregate.order.order_uid.clone();

        let outcome = conn
            .transaction::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    // Foreign keys are checked at the IMMEDIATE switch below, before commit.
                    diesel::sql_query("SET CONSTRAINTS ALL DEFERRED")
                        .execute(conn)
                        .await?;

                    let inserted = diesel::insert_into(orders::table)
                        .values(&aggregate.order)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;

                    if inserted == 0 {
                        return Ok(WriteOutcome::Duplicate);
                    }

                    diesel::insert_into(delivery::table)
                        .values(&aggregate.delivery)
                        .execute(conn)
                        .await?;

                    diesel::insert_into(payment::table)
                        .values(&aggregate.payment)
                        .execute(conn)
                        .await?;

                    if !aggregate.items.is_empty() {
                        diesel::insert_into(items::table)
                            .values(&aggregate.items)
                            .execute(conn)
                            .await?;
                    }

                    diesel::sql_query("SET CONSTRAINTS ALL IMMEDIATE")
                        .execute(conn)
                        .await?;

                    Ok(WriteOutcome::Inserted)
                })
            })
            .await?;

        match outcome {
            WriteOutcome::Inserted => info!("Committed order {}", order_uid),
            WriteOutcome::Duplicate => info!("Order {} already stored, skipped", order_uid),
        }

        Ok(outcome)
    }

    async fn read_order(&self, order_uid: &str) -> Result<Order, StoreError> {
        let mut conn = self.pool.get().await?;

        let order = orders::table
            .filter(orders::order_uid.eq(order_uid))
            .select(Order::as_select())
            .first::<Order>(&mut conn)
            .await?;
        Ok(order)
    }

    async fn read_delivery(&self, order_uid: &str) -> Result<Delivery, StoreError> {
        let mut conn = self.pool.get().await?;

        let delivery = delivery::table
            .filter(delivery::order_uid.eq(order_uid))
            .select(Delivery::as_select())
            .first::<Delivery>(&mut conn)
            .await?;
        Ok(delivery)
    }

    async fn read_payment(&self, order_uid: &str) -> Result<Payment, StoreError> {
        let mut conn = self.pool.get().await?;

        let payment = payment::table
            .filter(payment::order_uid.eq(order_uid))
            .select(Payment::as_select())
            .first::<Payment>(&mut conn)
            .await?;
        Ok(payment)
    }

    async fn read_items(&self, order_uid: &str) -> Result<Vec<Item>, StoreError> {
        let mut conn = self.pool.get().await?;

        let rows = items::table
            .filter(items::order_uid.eq(order_uid))
            .order(items::id.asc())
            .select(Item::as_select())
            .load::<Item>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn scan_orders(&self, sink: &mut OrderSink<'_>) -> Result<u64, StoreError> {
        let mut conn = self.pool.get().await?;

        let stream = orders::table
            .select(Order::as_select())
            .load_stream::<Order>(&mut conn)
            .await?;
        futures::pin_mut!(stream);

        let mut visited = 0u64;
        while let Some(order) = stream.try_next().await? {
            sink(order);
            visited += 1;
        }

        debug!("Scanned {} orders", visited);
        Ok(visited)
    }
}
