//! DynamoDB single-table persistence.
//!
//! Every record lives in one table keyed by the string partition key `pk`:
//!
//! | pk | record |
//! |---|---|
//! | `track#<id>` | track |
//! | `job#<uuid>` | conversion job |
//! | `trackjob#<trackId>` | pointer to the track's latest job |
//! | `session#<sid>` | stream session |
//! | `client#<context>` | pointer to the client context's active session |
//! | `stats#<trackId>` | stream counters with the `listeners` string set |
//!
//! Entities are stored as top-level attributes so counters can be updated atomically with `ADD`.

use crate::domain::jobs::{ConversionJob, JobStatus};
use crate::domain::session::StreamSession;
use crate::domain::track::{StreamStats, Track, TrackPatch};
use crate::error::BoxError;
use crate::ports::repository::{JobRepository, SessionRepository, StatsRepository, TrackRepository};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

const PK: &str = "pk";
const STATS_PREFIX: &str = "stats#";

type Item = HashMap<String, AttributeValue>;

/// DynamoRepository implements every repository port for AWS DynamoDB.
#[derive(Clone)]
pub struct DynamoRepository {
    client: Client,
    table_name: String,
}

impl DynamoRepository {
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }

    async fn get_item(&self, pk: String) -> Result<Option<Item>, BoxError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(PK, AttributeValue::S(pk))
            .consistent_read(true)
            .send()
            .await?;
        Ok(resp.item)
    }

    async fn put_entity<T: Serialize>(&self, pk: String, entity: &T) -> Result<(), BoxError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(pk, entity)?))
            .send()
            .await?;
        Ok(())
    }

    async fn get_entity<T: DeserializeOwned>(&self, pk: String) -> Result<Option<T>, BoxError> {
        match self.get_item(pk).await? {
            Some(item) => Ok(Some(from_item(item)?)),
            None => Ok(None),
        }
    }
}

fn track_pk(track_id: u64) -> String {
    format!("track#{}", track_id)
}

fn job_pk(job_id: Uuid) -> String {
    format!("job#{}", job_id)
}

fn latest_job_pk(track_id: u64) -> String {
    format!("trackjob#{}", track_id)
}

fn session_pk(session_id: &str) -> String {
    format!("session#{}", session_id)
}

fn client_pk(context_key: &str) -> String {
    format!("client#{}", context_key)
}

fn stats_pk(track_id: u64) -> String {
    format!("{}{}", STATS_PREFIX, track_id)
}

fn to_attribute(value: serde_json::Value) -> AttributeValue {
    use serde_json::Value;
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s),
        Value::Array(values) => AttributeValue::L(values.into_iter().map(to_attribute).collect()),
        Value::Object(fields) => AttributeValue::M(
            fields
                .into_iter()
                .map(|(name, value)| (name, to_attribute(value)))
                .collect(),
        ),
    }
}

fn from_attribute(value: &AttributeValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => n
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(n.clone())),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::L(values) => Value::Array(values.iter().map(from_attribute).collect()),
        AttributeValue::M(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), from_attribute(value)))
                .collect(),
        ),
        AttributeValue::Ss(values) => {
            Value::Array(values.iter().cloned().map(Value::String).collect())
        }
        _ => Value::Null,
    }
}

/// Flatten an entity into an item. Absent optional fields are left out so they can be tested
/// with `attribute_not_exists`.
fn to_item<T: Serialize>(pk: String, entity: &T) -> Result<Item, BoxError> {
    let serde_json::Value::Object(fields) = serde_json::to_value(entity)? else {
        return Err("entity does not serialize to a map".into());
    };
    let mut item: Item = fields
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name, to_attribute(value)))
        .collect();
    item.insert(PK.to_string(), AttributeValue::S(pk));
    Ok(item)
}

fn from_item<T: DeserializeOwned>(mut item: Item) -> Result<T, BoxError> {
    item.remove(PK);
    let fields: serde_json::Map<String, serde_json::Value> = item
        .iter()
        .map(|(name, value)| (name.clone(), from_attribute(value)))
        .collect();
    Ok(serde_json::from_value(serde_json::Value::Object(fields))?)
}

fn number<T: std::str::FromStr + Default>(item: &Item, name: &str) -> T {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
        .unwrap_or_default()
}

fn stats_from_item(track_id: u64, item: &Item) -> StreamStats {
    StreamStats {
        track_id,
        total_streams: number(item, "total_streams"),
        unique_users: item
            .get("listeners")
            .and_then(|v| v.as_ss().ok())
            .map(|listeners| listeners.len() as i64)
            .unwrap_or(0),
        last_streamed_at: item
            .get("last_streamed_at")
            .and_then(|v| v.as_s().ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at.with_timezone(&Utc)),
    }
}

/// `SET` clauses for the attributes a patch changes, with their name and value placeholders.
fn patch_expression(patch: &TrackPatch) -> Result<(String, Item, HashMap<String, String>), BoxError> {
    let serde_json::Value::Object(fields) = serde_json::to_value(patch)? else {
        return Err("patch does not serialize to a map".into());
    };
    let mut assignments = Vec::with_capacity(fields.len());
    let mut values = Item::new();
    let mut names = HashMap::new();
    for (i, (name, value)) in fields.into_iter().enumerate() {
        assignments.push(format!("#f{i} = :v{i}"));
        names.insert(format!("#f{i}"), name);
        values.insert(format!(":v{i}"), to_attribute(value));
    }

    let mut expression = String::new();
    if !assignments.is_empty() {
        expression = format!("SET {}", assignments.join(", "));
    }
    if patch.restore {
        if !expression.is_empty() {
            expression.push(' ');
        }
        expression.push_str("REMOVE deleted_at");
    }
    Ok((expression, values, names))
}

fn is_conditional_failure<E>(err: &aws_sdk_dynamodb::error::SdkError<E>) -> bool
where
    E: aws_sdk_dynamodb::error::ProvideErrorMetadata,
{
    err.as_service_error()
        .and_then(|e| e.code())
        .map(|code| code == "ConditionalCheckFailedException")
        .unwrap_or(false)
}

#[async_trait]
impl TrackRepository for DynamoRepository {
    async fn get_track(&self, track_id: u64) -> Result<Option<Track>, BoxError> {
        let track: Option<Track> = self.get_entity(track_pk(track_id)).await?;
        Ok(track.filter(|t| !t.is_deleted()))
    }

    async fn find_track(&self, track_id: u64) -> Result<Option<Track>, BoxError> {
        self.get_entity(track_pk(track_id)).await
    }

    async fn save_track(&self, track: &Track) -> Result<(), BoxError> {
        self.put_entity(track_pk(track.id), track).await
    }

    async fn update_track(&self, track_id: u64, patch: &TrackPatch) -> Result<Option<Track>, BoxError> {
        let (expression, values, names) = patch_expression(patch)?;
        if expression.is_empty() {
            return self.find_track(track_id).await;
        }

        let resp = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(PK, AttributeValue::S(track_pk(track_id)))
            .update_expression(expression)
            .condition_expression("attribute_exists(pk)")
            .set_expression_attribute_names((!names.is_empty()).then_some(names))
            .set_expression_attribute_values((!values.is_empty()).then_some(values))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;
        match resp {
            Ok(out) => out.attributes.map(from_item::<Track>).transpose(),
            Err(err) if is_conditional_failure(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_track(&self, track_id: u64, at: DateTime<Utc>) -> Result<bool, BoxError> {
        let resp = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(PK, AttributeValue::S(track_pk(track_id)))
            .update_expression("SET deleted_at = :at")
            .condition_expression("attribute_exists(pk) AND attribute_not_exists(deleted_at)")
            .expression_attribute_values(":at", AttributeValue::S(at.to_rfc3339()))
            .send()
            .await;
        match resp {
            Ok(_) => Ok(true),
            Err(err) if is_conditional_failure(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn increment_play_count(&self, track_id: u64) -> Result<Option<i64>, BoxError> {
        let resp = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(PK, AttributeValue::S(track_pk(track_id)))
            .update_expression("ADD play_count :one")
            .condition_expression("attribute_exists(pk) AND attribute_not_exists(deleted_at)")
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await;
        match resp {
            Ok(out) => Ok(out
                .attributes
                .map(|attrs| number::<i64>(&attrs, "play_count"))),
            Err(err) if is_conditional_failure(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl JobRepository for DynamoRepository {
    async fn save_job(&self, job: &ConversionJob) -> Result<(), BoxError> {
        self.put_entity(job_pk(job.id), job).await?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(PK, AttributeValue::S(latest_job_pk(job.track_id)))
            .item("job_id", AttributeValue::S(job.id.to_string()))
            .send()
            .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ConversionJob>, BoxError> {
        self.get_entity(job_pk(job_id)).await
    }

    async fn find_active_job(&self, track_id: u64) -> Result<Option<ConversionJob>, BoxError> {
        let latest = self
            .get_item(latest_job_pk(track_id))
            .await?
            .and_then(|item| item.get("job_id").and_then(|v| v.as_s().ok()).cloned())
            .and_then(|id| Uuid::parse_str(&id).ok());
        let Some(job_id) = latest else {
            return Ok(None);
        };
        Ok(self
            .get_job(job_id)
            .await?
            .filter(|job| job.status == JobStatus::Processing))
    }
}

#[async_trait]
impl SessionRepository for DynamoRepository {
    async fn save_session(&self, session: &StreamSession) -> Result<(), BoxError> {
        self.put_entity(session_pk(&session.session_id), session).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<StreamSession>, BoxError> {
        self.get_entity(session_pk(session_id)).await
    }

    async fn replace_active_session(
        &self,
        context_key: &str,
        session_id: &str,
    ) -> Result<Option<String>, BoxError> {
        let resp = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(PK, AttributeValue::S(client_pk(context_key)))
            .update_expression("SET session_id = :sid")
            .expression_attribute_values(":sid", AttributeValue::S(session_id.to_string()))
            .return_values(ReturnValue::AllOld)
            .send()
            .await?;
        Ok(resp
            .attributes
            .and_then(|attrs| attrs.get("session_id").and_then(|v| v.as_s().ok()).cloned())
            .filter(|previous| previous != session_id))
    }
}

#[async_trait]
impl StatsRepository for DynamoRepository {
    async fn get_stats(&self, track_id: u64) -> Result<StreamStats, BoxError> {
        Ok(self
            .get_item(stats_pk(track_id))
            .await?
            .map(|item| stats_from_item(track_id, &item))
            .unwrap_or_else(|| StreamStats::empty(track_id)))
    }

    async fn record_stream(
        &self,
        track_id: u64,
        user_id: u64,
        at: DateTime<Utc>,
    ) -> Result<StreamStats, BoxError> {
        let resp = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(PK, AttributeValue::S(stats_pk(track_id)))
            .update_expression(
                "SET track_id = :tid, last_streamed_at = :at ADD total_streams :one, listeners :user",
            )
            .expression_attribute_values(":tid", AttributeValue::N(track_id.to_string()))
            .expression_attribute_values(":at", AttributeValue::S(at.to_rfc3339()))
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .expression_attribute_values(":user", AttributeValue::Ss(vec![user_id.to_string()]))
            .return_values(ReturnValue::AllNew)
            .send()
            .await?;
        Ok(resp
            .attributes
            .map(|item| stats_from_item(track_id, &item))
            .unwrap_or_else(|| StreamStats::empty(track_id)))
    }

    async fn overwrite_total(
        &self,
        track_id: u64,
        total_streams: i64,
        last_streamed_at: DateTime<Utc>,
    ) -> Result<(), BoxError> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(PK, AttributeValue::S(stats_pk(track_id)))
            .update_expression("SET track_id = :tid, total_streams = :total, last_streamed_at = :at")
            .expression_attribute_values(":tid", AttributeValue::N(track_id.to_string()))
            .expression_attribute_values(":total", AttributeValue::N(total_streams.to_string()))
            .expression_attribute_values(":at", AttributeValue::S(last_streamed_at.to_rfc3339()))
            .send()
            .await?;
        Ok(())
    }

    async fn top_tracks(&self, limit: usize) -> Result<Vec<StreamStats>, BoxError> {
        let mut all = Vec::new();
        let mut start_key: Option<Item> = None;
        loop {
            let resp = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression("begins_with(pk, :prefix)")
                .expression_attribute_values(":prefix", AttributeValue::S(STATS_PREFIX.to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await?;
            for item in resp.items.unwrap_or_default() {
                let track_id: u64 = number(&item, "track_id");
                all.push(stats_from_item(track_id, &item));
            }
            match resp.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }
        all.sort_by(|a, b| {
            b.total_streams
                .cmp(&a.total_streams)
                .then(a.track_id.cmp(&b.track_id))
        });
        all.truncate(limit);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_item_round_trip_drops_absent_fields() {
        let track = Track::from_upload(42, 7, "raw/42.wav", "song.wav", "wav");
        let item = to_item(track_pk(42), &track).unwrap();

        assert_eq!(item.get(PK), Some(&AttributeValue::S("track#42".to_string())));
        assert!(!item.contains_key("deleted_at"));
        assert!(!item.contains_key("album_id"));
        assert_eq!(item.get("id"), Some(&AttributeValue::N("42".to_string())));

        let back: Track = from_item(item).unwrap();
        assert_eq!(back, track);
    }

    #[test]
    fn test_patch_expression_sets_only_patched_attributes() {
        let patch = TrackPatch {
            title: Some("Intro".into()),
            duration: Some(183.2),
            restore: true,
            ..Default::default()
        };
        let (expression, values, names) = patch_expression(&patch).unwrap();

        assert!(expression.starts_with("SET #f0 = :v0, #f1 = :v1"));
        assert!(expression.ends_with(" REMOVE deleted_at"));
        assert_eq!(values.len(), 2);
        let mut patched: Vec<&String> = names.values().collect();
        patched.sort();
        assert_eq!(patched, ["duration", "title"]);
        assert!(!names.values().any(|name| name == "play_count"));
    }

    #[test]
    fn test_empty_patch_has_no_expression() {
        let (expression, values, _) = patch_expression(&TrackPatch::default()).unwrap();
        assert!(expression.is_empty());
        assert!(values.is_empty());
    }

    #[test]
    fn test_job_item_round_trip() {
        let mut job = ConversionJob::new(42, "wav", "mp3");
        job.transition(JobStatus::Processing).unwrap();
        job.set_progress(1, 2);
        let back: ConversionJob = from_item(to_item(job_pk(job.id), &job).unwrap()).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_stats_from_item_counts_listeners() {
        let mut item = Item::new();
        item.insert("total_streams".into(), AttributeValue::N("5".into()));
        item.insert(
            "listeners".into(),
            AttributeValue::Ss(vec!["1".into(), "2".into()]),
        );
        item.insert(
            "last_streamed_at".into(),
            AttributeValue::S("2024-05-01T10:00:00+00:00".into()),
        );

        let stats = stats_from_item(9, &item);
        assert_eq!(stats.track_id, 9);
        assert_eq!(stats.total_streams, 5);
        assert_eq!(stats.unique_users, 2);
        assert!(stats.last_streamed_at.is_some());
    }
}
