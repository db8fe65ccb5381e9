//! 数据库字段映射工具
//!
//! 时间戳以微秒整数存储，超时以纳秒整数存储，参数与数据以JSON文本存储。

use std::time::Duration;

use chrono::{DateTime, Utc};
use edge_scheduler_core::{SchedulerError, SchedulerResult, TaskArgs};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn timestamp_to_db(value: DateTime<Utc>) -> i64 {
        value.timestamp_micros()
    }

    pub fn timestamp_from_db(micros: i64) -> SchedulerResult<DateTime<Utc>> {
        DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| SchedulerError::Serialization(format!("无效的时间戳: {micros}")))
    }

    pub fn optional_timestamp_sqlite(
        row: &SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        row.try_get::<Option<i64>, _>(field_name)?
            .map(Self::timestamp_from_db)
            .transpose()
    }

    pub fn duration_to_db(value: Duration) -> i64 {
        i64::try_from(value.as_nanos()).unwrap_or(i64::MAX)
    }

    pub fn duration_sqlite(row: &SqliteRow, field_name: &str) -> SchedulerResult<Duration> {
        let nanos: i64 = row.try_get(field_name)?;
        Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or(0)))
    }

    pub fn parse_args_sqlite(row: &SqliteRow, field_name: &str) -> SchedulerResult<TaskArgs> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析任务参数失败: {e}")))
    }

    pub fn parse_data_sqlite(
        row: &SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<Option<serde_json::Value>> {
        match row.try_get::<Option<String>, _>(field_name)? {
            Some(json_str) => serde_json::from_str(&json_str)
                .map(Some)
                .map_err(|e| SchedulerError::Serialization(format!("解析任务数据失败: {e}"))),
            None => Ok(None),
        }
    }

    pub fn progress_sqlite(row: &SqliteRow, field_name: &str) -> SchedulerResult<u8> {
        let progress: i64 = row.try_get(field_name)?;
        Ok(progress.clamp(0, i64::from(u8::MAX)) as u8)
    }
}
