use chrono::{DateTime, SubsecRound, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::*;

use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Order {
    pub order_uid: String,
    pub track_number: String,
    pub entry: String,
    pub locale: String,
    pub internal_signature: String,
    pub customer_id: String,
    pub delivery_service: String,
    pub shardkey: String,
    pub sm_id: i32,
    pub date_created: DateTime<Utc>,
    pub oof_shard: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::delivery)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Delivery {
    pub order_uid: String,
    pub name: String,
    pub phone: String,
    pub zip: String,
    pub city: String,
    pub address: String,
    pub region: String,
    pub email: String,
}

/// Payment row. Keyed by the owning order, `transaction` is informational.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::payment)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Payment {
    pub order_uid: String,
    pub transaction: String,
    pub request_id: String,
    pub currency: String,
    pub provider: String,
    pub amount: i32,
    pub payment_dt: i64,
    pub bank: String,
    pub delivery_cost: i32,
    pub goods_total: i32,
    pub custom_fee: i32,
}

/// Line item. The surrogate `id` column stays in the database.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Item {
    pub order_uid: String,
    pub chrt_id: i64,
    pub track_number: String,
    pub price: i32,
    pub rid: String,
    pub name: String,
    pub sale: i32,
    pub size: String,
    pub total_price: i32,
    pub nm_id: i64,
    pub brand: String,
    pub status: i32,
}

/// An order together with its delivery, payment and line items.
///
/// Serialises as `{"order", "delivery", "payment", "items"}`, which is the
/// body of `GET /order/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAggregate {
    pub order: Order,
    pub delivery: Delivery,
    pub payment: Payment,
    pub items: Vec<Item>,
}

impl OrderAggregate {
    pub fn order_uid(&self) -> &str {
        &self.order.order_uid
    }
}

/// PostgreSQL text columns cannot hold U+0000.
fn reject_nul(message: &OrderMessage) -> Result<(), DecodeError> {
    let delivery = &message.delivery;
    let payment = &message.payment;

    let fields = [
        ("order_uid", &message.order_uid),
        ("track_number", &message.track_number),
        ("entry", &message.entry),
        ("locale", &message.locale),
        ("internal_signature", &message.internal_signature),
        ("customer_id", &message.customer_id),
        ("delivery_service", &message.delivery_service),
        ("shardkey", &message.shardkey),
        ("oof_shard", &message.oof_shard),
        ("delivery.name", &delivery.name),
        ("delivery.phone", &delivery.phone),
        ("delivery.zip", &delivery.zip),
        ("delivery.city", &delivery.city),
        ("delivery.address", &delivery.address),
        ("delivery.region", &delivery.region),
        ("delivery.email", &delivery.email),
        ("payment.transaction", &payment.transaction),
        ("payment.request_id", &payment.request_id),
        ("payment.currency", &payment.currency),
        ("payment.provider", &payment.provider),
        ("payment.bank", &payment.bank),
    ];
    let item_fields = message.items.iter().flat_map(|item| {
        [
            ("items.track_number", &item.track_number),
            ("items.rid", &item.rid),
            ("items.name", &item.name),
            ("items.size", &item.size),
            ("items.brand", &item.brand),
        ]
    });

    match fields
        .into_iter()
        .chain(item_fields)
        .find(|(_, value)| value.contains('\0'))
    {
        Some((field, _)) => Err(DecodeError::NulCharacter { field }),
        None => Ok(()),
    }
}

impl TryFrom<OrderMessage> for OrderAggregate {
    type Error = DecodeError;

    fn try_from(message: OrderMessage) -> Result<Self, Self::Error> {
        if message.order_uid.trim().is_empty() {
            return Err(DecodeError::MissingOrderUid);
        }
        reject_nul(&message)?;

        // TIMESTAMPTZ keeps microseconds.
        let date_created = message
            .created_at()
            .map_err(|source| DecodeError::Timestamp {
                value: message.date_created.clone(),
                source,
            })?
            .trunc_subsecs(6);

        let order_uid = message.order_uid;

        let delivery = Delivery {
            order_uid: order_uid.clone(),
            name: message.delivery.name,
            phone: message.delivery.phone,
            zip: message.delivery.zip,
            city: message.delivery.city,
            address: message.delivery.address,
            region: message.delivery.region,
            email: message.delivery.email,
        };

        let payment = Payment {
            order_uid: order_uid.clone(),
            transaction: message.payment.transaction,
            request_id: message.payment.request_id,
            currency: message.payment.currency,
            provider: message.payment.provider,
            amount: message.payment.amount,
            payment_dt: message.payment.payment_dt,
            bank: message.payment.bank,
            delivery_cost: message.payment.delivery_cost,
            goods_total: message.payment.goods_total,
            custom_fee: message.payment.custom_fee,
        };

        let items = message
            .items
            .into_iter()
            .map(|item| Item {
                order_uid: order_uid.clone(),
                chrt_id: item.chrt_id,
                track_number: item.track_number,
                price: item.price,
                rid: item.rid,
                name: item.name,
                sale: item.sale,
                size: item.size,
                total_price: item.total_price,
                nm_id: item.nm_id,
                brand: item.brand,
                status: item.status,
            })
            .collect();

        let order = Order {
            order_uid,
            track_number: message.track_number,
            entry: message.entry,
            locale: message.locale,
            internal_signature: message.internal_signature,
            customer_id: message.customer_id,
            delivery_service: message.delivery_service,
            shardkey: message.shardkey,
            sm_id: message.sm_id,
            date_created,
            oof_shard: message.oof_shard,
        };

        Ok(Self {
            order,
            delivery,
            payment,
            items,
        })
    }
}
