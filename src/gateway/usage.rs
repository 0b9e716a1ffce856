//! Per-call usage accounting and the per-user summaries built on it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time};

use super::ids::IdGenerator;
use super::pipeline::{CallContext, CapturedResponse, PostStage};
use super::sniffer::{UsageSummary, extract_usage};
use super::sqlite_store::{SqliteStore, SqliteStoreError};
use super::store_types::{UsageEndpointDetail, UsageRecord, UsageTotals};
use super::{Clock, SystemClock};

const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");
const DAY_MS: i64 = 86_400_000;
pub const REJECTED_PREFIX: &str = "gateway: ";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DailyUsage {
    #[serde(flatten)]
    pub totals: UsageTotals,
    pub details: Vec<UsageEndpointDetail>,
}

pub fn parse_date(raw: &str) -> Option<Date> {
    Date::parse(raw.trim(), DATE_FORMAT).ok()
}

/// `[start, end)` of a UTC day in epoch milliseconds.
pub fn day_range_ms(date: Date) -> (i64, i64) {
    let start = date.with_time(Time::MIDNIGHT).assume_utc();
    let start_ms = i64::try_from(start.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX);
    (start_ms, start_ms.saturating_add(DAY_MS))
}

pub struct UsageRecorder {
    store: SqliteStore,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl UsageRecorder {
    pub fn new(store: SqliteStore, ids: Arc<IdGenerator>) -> Self {
        Self::with_clock(store, ids, Arc::new(SystemClock))
    }

    pub fn with_clock(store: SqliteStore, ids: Arc<IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self { store, ids, clock }
    }

    pub fn today(&self) -> Date {
        let now_ms = i128::from(self.clock.now_millis());
        OffsetDateTime::from_unix_timestamp_nanos(now_ms * 1_000_000)
            .map(OffsetDateTime::date)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH.date())
    }

    pub fn build_record(&self, ctx: &CallContext, response: &CapturedResponse) -> UsageRecord {
        let usage = if response.aborted {
            rejected_usage(response)
        } else {
            extract_usage(&response.body)
        };
        let model = usage
            .model
            .or_else(|| ctx.model.clone())
            .unwrap_or_default();
        UsageRecord {
            id: self.ids.next_id(),
            user_id: ctx.user_id.unwrap_or(0),
            endpoint: ctx.path.clone(),
            method: ctx.method.to_string(),
            status: response.status.as_u16(),
            request_size: ctx.request_size as u64,
            response_size: response.body.len() as u64,
            latency_ms: u64::try_from(response.latency.as_millis()).unwrap_or(u64::MAX),
            model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            error_message: usage.error_message,
            created_at_ms: i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX),
        }
    }

    pub async fn totals(&self, user_id: i64) -> Result<UsageTotals, SqliteStoreError> {
        self.store.usage_totals(user_id, None).await
    }

    pub async fn daily(&self, user_id: i64, date: Date) -> Result<DailyUsage, SqliteStoreError> {
        let (start, end) = day_range_ms(date);
        let totals = self.store.usage_totals(user_id, Some((start, end))).await?;
        let details = self.store.usage_by_endpoint(user_id, start, end).await?;
        Ok(DailyUsage { totals, details })
    }
}

/// A call the gateway answered itself: no backend tokens, and the error is
/// tagged so it can be told apart from backend failures.
fn rejected_usage(response: &CapturedResponse) -> UsageSummary {
    let reason = extract_usage(&response.body)
        .error_message
        .or_else(|| response.status.canonical_reason().map(str::to_string))
        .unwrap_or_default();
    UsageSummary {
        error_message: Some(format!("{REJECTED_PREFIX}{reason}")),
        ..UsageSummary::default()
    }
}

#[async_trait]
impl PostStage for UsageRecorder {
    fn name(&self) -> &'static str {
        "usage"
    }

    async fn finish(&self, ctx: &CallContext, response: &CapturedResponse) {
        let record = self.build_record(ctx, response);
        tracing::info!(
            request_id = %ctx.request_id,
            user_id = record.user_id,
            endpoint = %record.endpoint,
            status = record.status,
            latency_ms = record.latency_ms,
            total_tokens = record.total_tokens,
            "gateway call completed"
        );
        if let Err(err) = self.store.insert_usage(record).await {
            tracing::error!(request_id = %ctx.request_id, error = %err, "failed to record usage");
        }
    }
}
