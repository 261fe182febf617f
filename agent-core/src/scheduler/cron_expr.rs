use crate::constants::cron::{SECONDS_CRON_FIELDS, SYSTEM_CRON_FIELDS};
use crate::{AgentError, Result};
use cron::Schedule;
use std::str::FromStr;

/// 解析调度表达式，5 字段表达式补齐秒字段 `0`
///
/// 星期字段按系统 crontab 的编号理解（0 与 7 为周日，1 为周一），
/// 转换为 `cron` crate 的编号（1 为周日）后再解析。
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        SYSTEM_CRON_FIELDS => fields.insert(0, "0".to_string()),
        SECONDS_CRON_FIELDS => {}
        n => {
            return Err(AgentError::schedule(format!(
                "表达式 \"{expr}\" 包含 {n} 个字段，仅支持 5 或 6 个字段"
            )));
        }
    }

    if let Some(day_of_week) = fields.last_mut() {
        *day_of_week = crate_day_of_week(day_of_week)?;
    }
    Ok(Schedule::from_str(&fields.join(" "))?)
}

/// 转换为系统 crontab 的 5 字段格式，6 字段表达式去掉秒字段
pub fn system_cron_fields(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        SYSTEM_CRON_FIELDS => Ok(fields.join(" ")),
        SECONDS_CRON_FIELDS => Ok(fields[1..].join(" ")),
        n => Err(AgentError::schedule(format!(
            "表达式 \"{expr}\" 包含 {n} 个字段，无法写入系统 crontab"
        ))),
    }
}

/// 把系统 crontab 编号的星期字段逐项转换为 `cron` crate 编号
fn crate_day_of_week(field: &str) -> Result<String> {
    let items = field
        .split(',')
        .map(crate_day_of_week_item)
        .collect::<Result<Vec<_>>>()?;
    Ok(items.join(","))
}

/// `*`、`*/n` 与星期名称保持不变；数字、区间和步长展开为具体的星期列表
fn crate_day_of_week_item(item: &str) -> Result<String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    if range == "*" || range == "?" {
        return Ok(item.to_string());
    }

    let number = |value: &str| value.parse::<u32>().ok();
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => match (number(start), number(end)) {
            (Some(start), Some(end)) => (start, end),
            _ => return Ok(item.to_string()),
        },
        None => match number(range) {
            Some(start) if step.is_some() => (start, 6),
            Some(start) => (start, start),
            None => return Ok(item.to_string()),
        },
    };

    let step = match step {
        Some(step) => step
            .parse::<usize>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| AgentError::schedule(format!("星期字段步长无效: {item}")))?,
        None => 1,
    };
    if start > 7 || end > 7 || start > end {
        return Err(AgentError::schedule(format!("星期字段超出范围 0-7: {item}")));
    }

    let mut days: Vec<u32> = (start..=end).step_by(step).map(|day| day % 7 + 1).collect();
    days.sort_unstable();
    days.dedup();
    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Local, Timelike, Weekday};
    use std::collections::HashSet;

    fn weekdays(expr: &str) -> HashSet<Weekday> {
        parse_schedule(expr)
            .unwrap()
            .upcoming(Local)
            .take(14)
            .map(|t| t.weekday())
            .collect()
    }

    #[test]
    fn test_five_fields_fire_on_second_zero() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let next = schedule.upcoming(Local).next().unwrap();
        assert_eq!(next.second(), 0);
        assert_eq!(next.minute() % 5, 0);
    }

    #[test]
    fn test_six_fields_accepted() {
        assert!(parse_schedule("30 0 2 * * *").is_ok());
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(parse_schedule(""), Err(AgentError::Schedule(_))));
        assert!(matches!(parse_schedule("* * *"), Err(AgentError::Schedule(_))));
        assert!(matches!(
            parse_schedule("99 * * * *"),
            Err(AgentError::Cron(_))
        ));
        assert!(matches!(
            parse_schedule("0 2 * * 8"),
            Err(AgentError::Schedule(_))
        ));
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        assert_eq!(weekdays("0 0 2 * * 0"), HashSet::from([Weekday::Sun]));
        assert_eq!(weekdays("0 2 * * 7"), HashSet::from([Weekday::Sun]));
    }

    #[test]
    fn test_one_is_monday() {
        assert_eq!(weekdays("0 0 2 * * 1"), HashSet::from([Weekday::Mon]));
    }

    #[test]
    fn test_weekday_range() {
        assert_eq!(
            weekdays("0 2 * * 1-5"),
            HashSet::from([
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri
            ])
        );
        assert_eq!(
            weekdays("0 2 * * 5-7"),
            HashSet::from([Weekday::Fri, Weekday::Sat, Weekday::Sun])
        );
    }

    #[test]
    fn test_lists_steps_and_names() {
        assert_eq!(
            weekdays("0 2 * * 0,3"),
            HashSet::from([Weekday::Sun, Weekday::Wed])
        );
        assert_eq!(
            weekdays("0 2 * * */2"),
            HashSet::from([Weekday::Sun, Weekday::Tue, Weekday::Thu, Weekday::Sat])
        );
        assert_eq!(
            weekdays("0 2 * * 1/3"),
            HashSet::from([Weekday::Mon, Weekday::Thu])
        );
        assert_eq!(weekdays("0 2 * * MON"), HashSet::from([Weekday::Mon]));
    }

    #[test]
    fn test_day_of_week_conversion() {
        assert_eq!(crate_day_of_week("0").unwrap(), "1");
        assert_eq!(crate_day_of_week("7").unwrap(), "1");
        assert_eq!(crate_day_of_week("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(crate_day_of_week("*").unwrap(), "*");
        assert_eq!(crate_day_of_week("MON-FRI").unwrap(), "MON-FRI");
    }

    #[test]
    fn test_system_fields_keep_crontab_numbering() {
        assert_eq!(system_cron_fields("0 2 * * *").unwrap(), "0 2 * * *");
        assert_eq!(system_cron_fields("30  0 2 * * *").unwrap(), "0 2 * * *");
        assert_eq!(system_cron_fields("0 0 2 * * 1-5").unwrap(), "0 2 * * 1-5");
        assert!(system_cron_fields("0 0 2 * * * 2030").is_err());
    }
}
