//! In-memory [`OrderStore`] used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::error::StoreError;
use crate::models::*;
use crate::store::{OrderSink, OrderStore, WriteOutcome};

/// Builds a complete aggregate with one item priced 50.
pub fn aggregate(order_uid: &str) -> OrderAggregate {
    OrderAggregate {
        order: Order {
            order_uid: order_uid.to_string(),
            track_number: "WBILMTESTTRACK".to_string(),
            entry: "WBIL".to_string(),
            locale: "en".to_string(),
            internal_signature: String::new(),
            customer_id: "test".to_string(),
            delivery_service: "meest".to_string(),
            shardkey: "9".to_string(),
            sm_id: 99,
            date_created: Utc.with_ymd_and_hms(2021, 11, 26, 6, 22, 19).unwrap(),
            oof_shard: "1".to_string(),
        },
        delivery: Delivery {
            order_uid: order_uid.to_string(),
            name: "Test Testov".to_string(),
            phone: "+9720000000".to_string(),
            zip: "2639809".to_string(),
            city: "Kiryat Mozkin".to_string(),
            address: "Ploshad Mira 15".to_string(),
            region: "Kraiot".to_string(),
            email: "test@gmail.com".to_string(),
        },
        payment: Payment {
            order_uid: order_uid.to_string(),
            transaction: order_uid.to_string(),
            request_id: String::new(),
            currency: "USD".to_string(),
            provider: "wbpay".to_string(),
            amount: 1550,
            payment_dt: 1_637_907_727,
            bank: "alpha".to_string(),
            delivery_cost: 1500,
            goods_total: 50,
            custom_fee: 0,
        },
        items: vec![Item {
            order_uid: order_uid.to_string(),
            chrt_id: 1,
            track_number: "WBILMTESTTRACK".to_string(),
            price: 50,
            rid: "ab4219087a764ae0btest".to_string(),
            name: "Mascaras".to_string(),
            sale: 0,
            size: "0".to_string(),
            total_price: 50,
            nm_id: 2_389_212,
            brand: "Vivienne Sabo".to_string(),
            status: 202,
        }],
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reads {
    pub order: usize,
    pub delivery: usize,
    pub payment: usize,
    pub items: usize,
    pub scans: usize,
}

#[derive(Default)]
struct Tables {
    orders: HashMap<String, Order>,
    deliveries: HashMap<String, Delivery>,
    payments: HashMap<String, Payment>,
    items: HashMap<String, Vec<Item>>,
}

type WriteFailure = Box<dyn Fn() -> StoreError + Send + Sync>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    write_failure: Mutex<Option<WriteFailure>>,
    order_reads: AtomicUsize,
    delivery_reads: AtomicUsize,
    payment_reads: AtomicUsize,
    item_reads: AtomicUsize,
    scans: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn with_aggregates(aggregates: impl IntoIterator<Item = OrderAggregate>) -> Self {
        let store = Self::default();
        for aggregate in aggregates {
            store.insert(aggregate);
        }
        store
    }

    pub fn insert(&self, aggregate: OrderAggregate) {
        let mut tables = self.tables.lock().unwrap();
        let order_uid = aggregate.order.order_uid.clone();
        tables.orders.insert(order_uid.clone(), aggregate.order);
        tables.deliveries.insert(order_uid.clone(), aggregate.delivery);
        tables.payments.insert(order_uid.clone(), aggregate.payment);
        tables.items.insert(order_uid, aggregate.items);
    }

    pub fn remove_payment(&self, order_uid: &str) {
        self.tables.lock().unwrap().payments.remove(order_uid);
    }

    /// Makes every later write fail with the error built by `failure`.
    pub fn fail_writes_with(&self, failure: impl Fn() -> StoreError + Send + Sync + 'static) {
        *self.write_failure.lock().unwrap() = Some(Box::new(failure));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn reads(&self) -> Reads {
        Reads {
            order: self.order_reads.load(Ordering::SeqCst),
            delivery: self.delivery_reads.load(Ordering::SeqCst),
            payment: self.payment_reads.load(Ordering::SeqCst),
            items: self.item_reads.load(Ordering::SeqCst),
            scans: self.scans.load(Ordering::SeqCst),
        }
    }

    /// Number of write attempts that reached the store.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn order_count(&self) -> usize {
        self.tables.lock().unwrap().orders.len()
    }

    pub fn item_count(&self, order_uid: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .items
            .get(order_uid)
            .map_or(0, Vec::len)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn write_aggregate(&self, aggregate: &OrderAggregate) -> Result<WriteOutcome, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if let Some(failure) = self.write_failure.lock().unwrap().as_ref() {
            return Err(failure());
        }

        if self.tables.lock().unwrap().orders.contains_key(aggregate.order_uid()) {
            return Ok(WriteOutcome::Duplicate);
        }
        self.insert(aggregate.clone());
        Ok(WriteOutcome::Inserted)
    }

    async fn read_order(&self, order_uid: &str) -> Result<Order, StoreError> {
        self.order_reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let tables = self.tables.lock().unwrap();
        tables.orders.get(order_uid).cloned().ok_or(StoreError::NotFound)
    }

    async fn read_delivery(&self, order_uid: &str) -> Result<Delivery, StoreError> {
        self.delivery_reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let tables = self.tables.lock().unwrap();
        tables.deliveries.get(order_uid).cloned().ok_or(StoreError::NotFound)
    }

    async fn read_payment(&self, order_uid: &str) -> Result<Payment, StoreError> {
        self.payment_reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let tables = self.tables.lock().unwrap();
        tables.payments.get(order_uid).cloned().ok_or(StoreError::NotFound)
    }

    async fn read_items(&self, order_uid: &str) -> Result<Vec<Item>, StoreError> {
        self.item_reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables.items.get(order_uid).cloned().unwrap_or_default())
    }

    async fn scan_orders(&self, sink: &mut OrderSink<'_>) -> Result<u64, StoreError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let orders: Vec<Order> = self.tables.lock().unwrap().orders.values().cloned().collect();

        let mut visited = 0;
        for order in orders {
            sink(order);
            visited += 1;
        }
        Ok(visited)
    }
}
