//! Pulls a run date and distance out of free text (an LLM answer or raw OCR output).
//!
//! Patterns are tried in order, most specific first; the first hit wins. Dates come
//! out as `dd.mm.yyyy`, distances as `NN.NN км`.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use quest_core::{format_run_date, RunData, NOT_FOUND};
use regex::{Captures, Regex};

static LABELLED_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:date|дата)\s*[:=\-]\s*(\d{1,2})[./\-](\d{1,2})[./\-](\d{4}|\d{2})\b")
        .expect("labelled date regex")
});

static NUMERIC_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[./](\d{1,2})[./](\d{4}|\d{2})\b").expect("numeric date regex")
});

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})").expect("iso date regex"));

static RU_MONTH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})\s+(январ[яь]|феврал[яь]|марта?|апрел[яь]|ма[йя]|июн[яь]|июл[яь]|августа?|сентябр[яь]|октябр[яь]|ноябр[яь]|декабр[яь]|янв|фев|мар|апр|июн|июл|авг|сен|сент|окт|ноя|дек)\b\.?(?:\s+(\d{4}))?",
    )
    .expect("russian month regex")
});

static EN_MONTH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{1,2}),?\s+(\d{4})\b")
        .expect("english month regex")
});

static LABELLED_DISTANCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:distance|дистанция|расстояние)\s*[:=\-]\s*(\d+(?:[.,]\d+)?)\s*(км|km|м|m)?")
        .expect("labelled distance regex")
});

static UNIT_DISTANCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(км|km|kilometers|километр[а-я]*)(?:[^\p{L}]|$)")
        .expect("unit distance regex")
});

static KNOWN_DISTANCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\d.,:])(42[.,]195|42[.,]2|21[.,]0975|21[.,]1|10[.,]0|10|5[.,]0|5)(?:[^\d.,:]|$)")
        .expect("known distance regex")
});

/// Combines the LLM answer with the OCR text: each field is taken from the answer
/// when present there, otherwise from the OCR text, otherwise `"not found"`.
/// `today` supplies the year for dates printed without one.
pub fn extract_run_data(llm_answer: &str, ocr_text: &str, today: NaiveDate) -> RunData {
    let date = find_date(llm_answer, today)
        .or_else(|| find_date(ocr_text, today))
        .unwrap_or_else(|| NOT_FOUND.to_string());
    let distance = find_distance(llm_answer)
        .or_else(|| find_distance(ocr_text))
        .or_else(|| find_known_distance(ocr_text))
        .unwrap_or_else(|| NOT_FOUND.to_string());
    RunData { date, distance }
}

pub fn find_date(text: &str, today: NaiveDate) -> Option<String> {
    first_valid(&LABELLED_DATE, text, |c| dmy(c, 1, 2, 3))
        .or_else(|| first_valid(&NUMERIC_DATE, text, |c| dmy(c, 1, 2, 3)))
        .or_else(|| {
            first_valid(&ISO_DATE, text, |c| {
                NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
            })
        })
        .or_else(|| {
            first_valid(&RU_MONTH_DATE, text, |c| {
                let day = c[1].parse().ok()?;
                let month = ru_month(&c[2])?;
                let year = match c.get(3) {
                    Some(year) => year.as_str().parse().ok()?,
                    None => today.year(),
                };
                NaiveDate::from_ymd_opt(year, month, day)
            })
        })
        .or_else(|| {
            first_valid(&EN_MONTH_DATE, text, |c| {
                let month = en_month(&c[1])?;
                NaiveDate::from_ymd_opt(c[3].parse().ok()?, month, c[2].parse().ok()?)
            })
        })
        .map(format_run_date)
}

pub fn find_distance(text: &str) -> Option<String> {
    LABELLED_DISTANCE
        .captures_iter(text)
        .find_map(|c| {
            let value = parse_number(&c[1])?;
            let in_meters = c
                .get(2)
                .is_some_and(|unit| matches!(unit.as_str().to_lowercase().as_str(), "м" | "m"));
            Some(if in_meters { value / 1000.0 } else { value })
        })
        .or_else(|| {
            UNIT_DISTANCE
                .captures_iter(text)
                .find_map(|c| parse_number(&c[1]))
        })
        .filter(|km| *km > 0.0 && *km < 1000.0)
        .map(format_distance)
}

/// Last resort over raw OCR text: standard race distances printed without a unit.
pub fn find_known_distance(text: &str) -> Option<String> {
    KNOWN_DISTANCE
        .captures_iter(text)
        .find_map(|c| parse_number(&c[1]))
        .map(format_distance)
}

pub fn format_distance(km: f64) -> String {
    format!("{km:.2} км")
}

fn first_valid<F>(re: &Regex, text: &str, build: F) -> Option<NaiveDate>
where
    F: Fn(&Captures<'_>) -> Option<NaiveDate>,
{
    re.captures_iter(text).find_map(|c| build(&c))
}

fn dmy(c: &Captures<'_>, day: usize, month: usize, year: usize) -> Option<NaiveDate> {
    let year_text = &c[year];
    let mut year: i32 = year_text.parse().ok()?;
    if year_text.len() == 2 {
        year += 2000;
    }
    NaiveDate::from_ymd_opt(year, c[month].parse().ok()?, c[day].parse().ok()?)
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', ".").parse().ok()
}

fn ru_month(name: &str) -> Option<u32> {
    let name = name.to_lowercase();
    let month = match name.chars().take(3).collect::<String>().as_str() {
        "янв" => 1,
        "фев" => 2,
        "мар" => 3,
        "апр" => 4,
        "май" | "мая" => 5,
        "июн" => 6,
        "июл" => 7,
        "авг" => 8,
        "сен" => 9,
        "окт" => 10,
        "ноя" => 11,
        "дек" => 12,
        _ => return None,
    };
    Some(month)
}

fn en_month(name: &str) -> Option<u32> {
    let month = match name.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 30).unwrap()
    }

    #[test]
    fn labelled_llm_answer_is_normalised() {
        let data = extract_run_data("date: 26.11.2025\ndistance: 10,5 км", "", today());
        assert_eq!(data, RunData::new("26.11.2025", "10.50 км"));
    }

    #[test]
    fn russian_month_names_and_missing_year() {
        assert_eq!(find_date("Пробежка 3 декабря 2025, 07:14", today()).as_deref(), Some("03.12.2025"));
        assert_eq!(find_date("26 ноя • утро", today()).as_deref(), Some("26.11.2025"));
        assert_eq!(find_date("Nov 27, 2025", today()).as_deref(), Some("27.11.2025"));
        assert_eq!(find_date("2025-11-28T06:00", today()).as_deref(), Some("28.11.2025"));
    }

    #[test]
    fn impossible_dates_are_skipped() {
        assert_eq!(find_date("31.02.2025 then 01.12.2025", today()).as_deref(), Some("01.12.2025"));
        assert_eq!(find_date("no dates here", today()), None);
    }

    #[test]
    fn distances_with_units() {
        assert_eq!(find_distance("Дистанция: 5210 м").as_deref(), Some("5.21 км"));
        assert_eq!(find_distance("Total 21,1 km in 1:58:03").as_deref(), Some("21.10 км"));
        assert_eq!(find_distance("pace 5:30 /km").as_deref(), None);
    }

    #[test]
    fn ocr_text_backs_up_a_useless_answer() {
        let data = extract_run_data(
            "date: not found\ndistance: not found",
            "Забег 26.11.2025\nВремя 45:10\n10",
            today(),
        );
        assert_eq!(data, RunData::new("26.11.2025", "10.00 км"));
    }

    #[test]
    fn known_literals_prefer_the_marathon() {
        assert_eq!(find_known_distance("Finisher 42.2 time 3:59:59").as_deref(), Some("42.20 км"));
        assert_eq!(find_known_distance("pace 4:55"), None);
    }

    #[test]
    fn nothing_found_yields_sentinels() {
        let data = extract_run_data("sorry", "blurry", today());
        assert_eq!(data, RunData::not_found());
        assert!(!data.is_usable());
    }
}
