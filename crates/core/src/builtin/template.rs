use chrono::Datelike;

use crate::cache::DateKey;

/// Replace date tokens in `template`.
///
/// Supported tokens: `{year}`, `{doy}` (zero-padded to three digits),
/// `{month}`, `{day}` (two digits) and `{yyyymmdd}`. Month and day tokens are
/// left untouched when `date` is not a real calendar day.
pub fn render_date(template: &str, date: DateKey) -> String {
    let mut out = template
        .replace("{year}", &date.year.to_string())
        .replace("{doy}", &format!("{:03}", date.day_of_year));
    if let Some(day) = date.to_date() {
        out = out
            .replace("{month}", &format!("{:02}", day.month()))
            .replace("{day}", &format!("{:02}", day.day()))
            .replace("{yyyymmdd}", &day.format("%Y%m%d").to_string());
    }
    out
}

/// Replace `{key}` for every pair.
pub(crate) fn render_vars(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_date_tokens() {
        let date = DateKey::new(2024, 45);
        assert_eq!(
            render_date("https://x/{year}/{doy}/f_{yyyymmdd}_{month}{day}.tif", date),
            "https://x/2024/045/f_20240214_0214.tif"
        );
    }

    #[test]
    fn test_render_vars_leaves_unknown_tokens() {
        let out = render_vars(
            "{index}_{zone}.csv",
            &[("index", "ndvi".to_string())],
        );
        assert_eq!(out, "ndvi_{zone}.csv");
    }
}
