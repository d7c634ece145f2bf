use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::debug;

use taskman_core::{SchedulerError, SchedulerResult};

/// CRON表达式解析和下次触发时间计算
///
/// 接受标准五段式（分 时 日 月 周，周取0-7且0和7都表示周日）、
/// 以秒开头的六段式、带年份的七段式以及 `@daily` 等宏。
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
}

impl CronTrigger {
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let normalized = normalize_expression(expr)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(expr, e.to_string()))?;
        debug!("CRON表达式 '{}' 解析为 '{}'", expr, normalized);

        Ok(Self {
            expression: expr.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 严格晚于 `after` 的下一次触发时间
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }
}

/// 计算表达式在 `after` 之后的下一次触发时间
pub fn next_fire_after(
    expr: &str,
    after: DateTime<Utc>,
) -> SchedulerResult<Option<DateTime<Utc>>> {
    Ok(CronTrigger::parse(expr)?.next_fire_after(after))
}

fn invalid(expr: &str, message: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidCronExpression {
        expr: expr.to_string(),
        message: message.into(),
    }
}

/// 转换为cron库使用的格式：补齐秒字段，并把Unix周字段（0-7，0/7为周日）映射为1-7（1为周日）
fn normalize_expression(expr: &str) -> SchedulerResult<String> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(invalid(expr, "表达式为空"));
    }
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => return Err(invalid(expr, format!("需要5到7个字段，实际为{n}个"))),
    }

    fields[5] = normalize_day_of_week(expr, &fields[5])?;
    Ok(fields.join(" "))
}

fn normalize_day_of_week(expr: &str, field: &str) -> SchedulerResult<String> {
    if field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let mut days = Vec::new();
    for item in field.split(',') {
        if item == "*" || item == "?" {
            return Ok(field.to_string());
        }
        days.extend(expand_item(expr, item)?);
    }

    let mut mapped: Vec<u32> = days.into_iter().map(|d| if d == 7 { 1 } else { d + 1 }).collect();
    mapped.sort_unstable();
    mapped.dedup();

    Ok(mapped
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

fn expand_item(expr: &str, item: &str) -> SchedulerResult<Vec<u32>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| invalid(expr, format!("无效的步长: {item}")))?;
            if step == 0 {
                return Err(invalid(expr, format!("步长不能为0: {item}")));
            }
            (range, step)
        }
        None => (item, 1),
    };

    let (start, end) = if range == "*" {
        (0, 6)
    } else if let Some((start, end)) = range.split_once('-') {
        (parse_day(expr, start)?, parse_day(expr, end)?)
    } else {
        let day = parse_day(expr, range)?;
        if item.contains('/') {
            (day, 6)
        } else {
            (day, day)
        }
    };

    if start > end {
        return Err(invalid(expr, format!("无效的范围: {item}")));
    }
    Ok((start..=end).step_by(step as usize).collect())
}

fn parse_day(expr: &str, value: &str) -> SchedulerResult<u32> {
    let day: u32 = value
        .parse()
        .map_err(|_| invalid(expr, format!("无效的星期值: {value}")))?;
    if day > 7 {
        return Err(invalid(expr, format!("星期值超出范围: {day}")));
    }
    Ok(day)
}
