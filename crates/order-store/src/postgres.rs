use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, OrderId};
use domain::{
    CustomerContact, FulfillmentWebhookEvent, Order, OrderError, OrderItem, OrderParts,
    OrderStatus, PaymentWebhookEvent, ShippingAddress, SubmissionFailure,
};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{OrderStore, PaymentEventInsert},
};

const ORDER_COLUMNS: &str = r#"
    id, customer_email, customer_name, total_minor, currency,
    ship_name, ship_line1, ship_line2, ship_city, ship_state, ship_postal_code, ship_country,
    payment_session_id, payment_intent_id, fulfillment_order_id, tracking_number, tracking_url,
    status, submission_attempts, needs_attention, created_at, updated_at
"#;

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Creates a new PostgreSQL order store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_order(row: &PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;
        let status: OrderStatus = status
            .parse()
            .map_err(|e: domain::UnknownStatus| StoreError::Corrupt(e.to_string()))?;
        let attempts: i32 = row.try_get("submission_attempts")?;

        let shipping = match row.try_get::<Option<String>, _>("ship_line1")? {
            Some(line1) => Some(ShippingAddress {
                name: row
                    .try_get::<Option<String>, _>("ship_name")?
                    .unwrap_or_default(),
                line1,
                line2: row.try_get("ship_line2")?,
                city: row
                    .try_get::<Option<String>, _>("ship_city")?
                    .unwrap_or_default(),
                state: row.try_get("ship_state")?,
                postal_code: row
                    .try_get::<Option<String>, _>("ship_postal_code")?
                    .unwrap_or_default(),
                country: row
                    .try_get::<Option<String>, _>("ship_country")?
                    .unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Order::from(OrderParts {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            contact: CustomerContact {
                email: row.try_get("customer_email")?,
                name: row.try_get("customer_name")?,
            },
            total: Money::from_minor(row.try_get("total_minor")?),
            currency: row.try_get("currency")?,
            shipping,
            payment_session_id: row.try_get("payment_session_id")?,
            payment_intent_id: row.try_get("payment_intent_id")?,
            fulfillment_order_id: row.try_get("fulfillment_order_id")?,
            tracking_number: row.try_get("tracking_number")?,
            tracking_url: row.try_get("tracking_url")?,
            status,
            submission_attempts: u32::try_from(attempts)
                .map_err(|_| StoreError::Corrupt(format!("negative attempts: {attempts}")))?,
            needs_attention: row.try_get("needs_attention")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    fn row_to_item(row: &PgRow) -> Result<OrderItem> {
        let quantity: i32 = row.try_get("quantity")?;
        Ok(OrderItem {
            id: row.try_get("id")?,
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            product_name: row.try_get("product_name")?,
            variant_name: row.try_get("variant_name")?,
            quantity: u32::try_from(quantity)
                .map_err(|_| StoreError::Corrupt(format!("bad quantity: {quantity}")))?,
            unit_price: Money::from_minor(row.try_get("unit_price_minor")?),
            line_price: Money::from_minor(row.try_get("line_price_minor")?),
            fulfillment_variant_id: row.try_get("fulfillment_variant_id")?,
        })
    }

    fn row_to_failure(row: &PgRow) -> Result<SubmissionFailure> {
        let attempt: i32 = row.try_get("attempt")?;
        Ok(SubmissionFailure {
            id: row.try_get("id")?,
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            attempt: u32::try_from(attempt)
                .map_err(|_| StoreError::Corrupt(format!("bad attempt: {attempt}")))?,
            error: row.try_get("error")?,
            retryable: row.try_get("retryable")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Locks one order row for the rest of the transaction.
    async fn lock_order(tx: &mut Transaction<'_, Postgres>, id: OrderId) -> Result<Order> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::OrderNotFound(id))?;

        Self::row_to_order(&row)
    }

    /// Writes back every mutable order column.
    async fn write_order(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<()> {
        let shipping = order.shipping();
        sqlx::query(
            r#"
            UPDATE orders SET
                customer_email = $2,
                customer_name = $3,
                ship_name = $4,
                ship_line1 = $5,
                ship_line2 = $6,
                ship_city = $7,
                ship_state = $8,
                ship_postal_code = $9,
                ship_country = $10,
                payment_session_id = $11,
                payment_intent_id = $12,
                fulfillment_order_id = $13,
                tracking_number = $14,
                tracking_url = $15,
                status = $16,
                submission_attempts = $17,
                needs_attention = $18,
                updated_at = $19
            WHERE id = $1
            "#,
        )
        .bind(order.id().as_uuid())
        .bind(&order.contact().email)
        .bind(&order.contact().name)
        .bind(shipping.map(|s| s.name.as_str()))
        .bind(shipping.map(|s| s.line1.as_str()))
        .bind(shipping.and_then(|s| s.line2.as_deref()))
        .bind(shipping.map(|s| s.city.as_str()))
        .bind(shipping.and_then(|s| s.state.as_deref()))
        .bind(shipping.map(|s| s.postal_code.as_str()))
        .bind(shipping.map(|s| s.country.as_str()))
        .bind(order.payment_session_id())
        .bind(order.payment_intent_id())
        .bind(order.fulfillment_order_id())
        .bind(order.tracking_number())
        .bind(order.tracking_url())
        .bind(order.status().as_str())
        .bind(attempts_i32(order.submission_attempts()))
        .bind(order.needs_attention())
        .bind(order.updated_at())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

fn attempts_i32(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn limit_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let shipping = order.shipping();

        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
        ))
        .bind(order.id().as_uuid())
        .bind(&order.contact().email)
        .bind(&order.contact().name)
        .bind(order.total().minor_units())
        .bind(order.currency())
        .bind(shipping.map(|s| s.name.as_str()))
        .bind(shipping.map(|s| s.line1.as_str()))
        .bind(shipping.and_then(|s| s.line2.as_deref()))
        .bind(shipping.map(|s| s.city.as_str()))
        .bind(shipping.and_then(|s| s.state.as_deref()))
        .bind(shipping.map(|s| s.postal_code.as_str()))
        .bind(shipping.map(|s| s.country.as_str()))
        .bind(order.payment_session_id())
        .bind(order.payment_intent_id())
        .bind(order.fulfillment_order_id())
        .bind(order.tracking_number())
        .bind(order.tracking_url())
        .bind(order.status().as_str())
        .bind(attempts_i32(order.submission_attempts()))
        .bind(order.needs_attention())
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::DuplicateOrder(order.id());
            }
            StoreError::Database(e)
        })?;

        for (position, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, product_name, variant_name, quantity,
                    unit_price_minor, line_price_minor, fulfillment_variant_id, position)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(item.id)
            .bind(item.order_id.as_uuid())
            .bind(&item.product_name)
            .bind(&item.variant_name)
            .bind(i32::try_from(item.quantity).unwrap_or(i32::MAX))
            .bind(item.unit_price.minor_units())
            .bind(item.line_price.minor_units())
            .bind(&item.fulfillment_variant_id)
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn get_items(&self, id: OrderId) -> Result<Vec<OrderItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, product_name, variant_name, quantity,
                   unit_price_minor, line_price_minor, fulfillment_variant_id
            FROM order_items
            WHERE order_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_item).collect()
    }

    async fn find_by_fulfillment_id(&self, fulfillment_order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE fulfillment_order_id = $1"
        ))
        .bind(fulfillment_order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn find_by_payment_session(&self, session_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE payment_session_id = $1 LIMIT 1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn modify_order<T, F>(&self, id: OrderId, transition: F) -> Result<(Order, T)>
    where
        F: FnOnce(&mut Order) -> std::result::Result<T, OrderError> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut order = Self::lock_order(&mut tx, id).await?;

        // Dropping the transaction on error rolls back and releases the lock.
        let value = transition(&mut order)?;
        Self::write_order(&mut tx, &order).await?;

        tx.commit().await?;
        Ok((order, value))
    }

    async fn record_submission_failure(
        &self,
        id: OrderId,
        error: &str,
        retryable: bool,
        max_attempts: u32,
    ) -> Result<(Order, SubmissionFailure)> {
        let mut tx = self.pool.begin().await?;
        let mut order = Self::lock_order(&mut tx, id).await?;

        let failure = order.fail_submission(error, retryable, max_attempts)?;
        Self::write_order(&mut tx, &order).await?;

        sqlx::query(
            r#"
            INSERT INTO submission_failures (id, order_id, attempt, error, retryable, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(failure.id)
        .bind(failure.order_id.as_uuid())
        .bind(attempts_i32(failure.attempt))
        .bind(&failure.error)
        .bind(failure.retryable)
        .bind(failure.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((order, failure))
    }

    async fn submission_failures(&self, id: OrderId) -> Result<Vec<SubmissionFailure>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, attempt, error, retryable, created_at
            FROM submission_failures
            WHERE order_id = $1
            ORDER BY attempt ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_failure).collect()
    }

    async fn find_retryable(&self, max_attempts: u32, limit: usize) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE status = $1
              AND fulfillment_order_id IS NULL
              AND needs_attention = FALSE
              AND submission_attempts < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(OrderStatus::Paid.as_str())
        .bind(attempts_i32(max_attempts))
        .bind(limit_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order).collect()
    }

    async fn find_by_status(
        &self,
        status: OrderStatus,
        updated_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE status = $1
              AND ($2::timestamptz IS NULL OR updated_at < $2)
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(status.as_str())
        .bind(updated_before)
        .bind(limit_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order).collect()
    }

    async fn insert_payment_event(
        &self,
        event: &PaymentWebhookEvent,
    ) -> Result<PaymentEventInsert> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_webhook_events (id, event_id, event_type, payload, processed, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT ON CONSTRAINT unique_payment_event_id DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.processed)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(PaymentEventInsert::Inserted);
        }

        let processed: bool = sqlx::query_scalar(
            "SELECT processed FROM payment_webhook_events WHERE event_id = $1",
        )
        .bind(&event.event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(PaymentEventInsert::Duplicate { processed })
    }

    async fn mark_payment_event_processed(&self, event_id: &str) -> Result<()> {
        sqlx::query("UPDATE payment_webhook_events SET processed = TRUE WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_fulfillment_event(&self, event: &FulfillmentWebhookEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fulfillment_webhook_events (id, event_type, provider_order_id, payload, processed, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(event.provider_order_id.as_deref())
        .bind(&event.payload)
        .bind(event.processed)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fulfillment_event_processed_since(
        &self,
        provider_order_id: &str,
        event_type: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM fulfillment_webhook_events
                WHERE provider_order_id = $1
                  AND event_type = $2
                  AND processed = TRUE
                  AND received_at >= $3
            )
            "#,
        )
        .bind(provider_order_id)
        .bind(event_type)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn mark_fulfillment_event_processed(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE fulfillment_webhook_events SET processed = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
