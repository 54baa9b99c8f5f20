// Current date/time tool for temporal grounding

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Tool, ToolResult};
use crate::types::{AppError, AppResult, ToolSpec};

pub const TOOL_NAME: &str = "get_current_datetime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DateFormat {
    #[default]
    Full,
    DateOnly,
    Iso,
    SearchFriendly,
}

#[derive(Debug, Deserialize)]
struct DateTimeArgs {
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    format: DateFormat,
    #[serde(default)]
    relative_days: Option<i64>,
}

pub struct DateTimeTool {
    default_timezone: String,
}

/// Parse an IANA zone name, falling back to UTC
pub fn resolve_timezone(name: &str) -> (Tz, String) {
    match name.trim().parse::<Tz>() {
        Ok(tz) => (tz, tz.name().to_string()),
        Err(_) => (Tz::UTC, "UTC".to_string()),
    }
}

pub fn format_datetime(at: &DateTime<Tz>, format: DateFormat) -> String {
    match format {
        DateFormat::Full => at.format("%A, %B %d, %Y at %I:%M %p %Z").to_string(),
        DateFormat::DateOnly => at.format("%Y-%m-%d").to_string(),
        DateFormat::Iso => at.to_rfc3339(),
        DateFormat::SearchFriendly => at.format("%B %d, %Y").to_string(),
    }
}

/// Full tool payload for `now` in the given zone
pub fn describe_moment(now_utc: DateTime<Utc>, timezone: &str, format: DateFormat, relative_days: Option<i64>) -> AppResult<Value> {
    let (tz, tz_name) = resolve_timezone(timezone);
    let now = now_utc.with_timezone(&tz);

    let target = match relative_days {
        Some(days) => now
            .checked_add_signed(Duration::days(days))
            .ok_or_else(|| AppError::Tool(format!("relative_days out of range: {}", days)))?,
        None => now,
    };
    let day = |offset: i64| (now + Duration::days(offset)).format("%Y-%m-%d").to_string();

    let mut result = json!({
        "current_datetime": now.to_rfc3339(),
        "formatted": format_datetime(&target, format),
        "timezone": tz_name,
        "date_components": {
            "year": target.year(),
            "month": target.month(),
            "month_name": target.format("%B").to_string(),
            "day": target.day(),
            "weekday": target.format("%A").to_string(),
            "hour": target.hour(),
            "minute": target.minute(),
        },
        "relative_dates": {
            "yesterday": day(-1),
            "last_week": day(-7),
            "last_month": day(-30),
            "tomorrow": day(1),
        },
    });

    if let Some(days) = relative_days {
        result["calculated_date"] = json!(target.format("%Y-%m-%d").to_string());
        result["days_offset"] = json!(days);
    }
    Ok(result)
}

impl DateTimeTool {
    pub fn new(default_timezone: &str) -> Self {
        Self {
            default_timezone: default_timezone.to_string(),
        }
    }
}

#[async_trait]
impl Tool for DateTimeTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_NAME.to_string(),
            description: "Get the current date and time information. Use this tool when you need to:\n- Know today's date for time-sensitive queries\n- Calculate relative dates like \"yesterday\", \"last week\", \"3 days ago\"\n- Understand the temporal context of user queries\n- Format dates for search queries".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "timezone": {
                        "type": "string",
                        "description": "Timezone name (e.g., 'UTC', 'America/New_York', 'Europe/London', 'Asia/Tokyo'). Defaults to UTC.",
                        "default": "UTC"
                    },
                    "format": {
                        "type": "string",
                        "enum": ["full", "date_only", "iso", "search_friendly"],
                        "description": "Output format. 'full' for complete datetime, 'date_only' for YYYY-MM-DD, 'iso' for ISO format, 'search_friendly' for natural date format.",
                        "default": "full"
                    },
                    "relative_days": {
                        "type": "integer",
                        "description": "Calculate a date relative to today. Use negative numbers for past dates (e.g., -1 for yesterday, -7 for last week)."
                    }
                },
                "required": []
            }),
        }
    }

    async fn invoke(&self, arguments: Value) -> ToolResult {
        let outcome = parse_args::<DateTimeArgs>(TOOL_NAME, &arguments).and_then(|args| {
            let timezone = args.timezone.as_deref().unwrap_or(&self.default_timezone);
            describe_moment(Utc::now(), timezone, args.format, args.relative_days).map(|v| (v, Vec::new()))
        });
        ToolResult::from_outcome(TOOL_NAME, arguments, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 0).unwrap()
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let (tz, name) = resolve_timezone("Mars/Olympus_Mons");
        assert_eq!(tz, Tz::UTC);
        assert_eq!(name, "UTC");
        assert_eq!(resolve_timezone("Asia/Tokyo").1, "Asia/Tokyo");
    }

    #[test]
    fn test_formats() {
        let v = describe_moment(fixed_now(), "UTC", DateFormat::Full, None).unwrap();
        assert_eq!(v["formatted"], "Friday, March 15, 2024 at 02:30 PM UTC");

        let v = describe_moment(fixed_now(), "UTC", DateFormat::SearchFriendly, None).unwrap();
        assert_eq!(v["formatted"], "March 15, 2024");

        let v = describe_moment(fixed_now(), "Asia/Tokyo", DateFormat::DateOnly, None).unwrap();
        assert_eq!(v["formatted"], "2024-03-15");
        assert_eq!(v["date_components"]["hour"], 23);

        let v = describe_moment(fixed_now(), "UTC", DateFormat::Iso, None).unwrap();
        assert_eq!(v["formatted"], "2024-03-15T14:30:00+00:00");
    }

    #[test]
    fn test_relative_dates() {
        let v = describe_moment(fixed_now(), "UTC", DateFormat::DateOnly, Some(-7)).unwrap();
        assert_eq!(v["formatted"], "2024-03-08");
        assert_eq!(v["calculated_date"], "2024-03-08");
        assert_eq!(v["days_offset"], -7);
        assert_eq!(v["relative_dates"]["yesterday"], "2024-03-14");
        assert_eq!(v["relative_dates"]["last_month"], "2024-02-14");
        assert_eq!(v["relative_dates"]["tomorrow"], "2024-03-16");
    }

    #[tokio::test]
    async fn test_invoke_uses_default_timezone() {
        let tool = DateTimeTool::new("Europe/London");
        let result = tool.invoke(json!({})).await;
        assert!(result.success);
        assert_eq!(result.output["timezone"], "Europe/London");

        let bad = tool.invoke(json!({"format": "weird"})).await;
        assert!(!bad.success);
    }
}
