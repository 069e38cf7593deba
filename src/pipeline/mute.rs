//! Mute filter evaluation.
//!
//! A filter matches when all three parts hold: some classpath of the resource
//! starts with the filter prefix, the ident regex matches, and every required
//! tag is present with the same value. Missing resource data never mutes.

use crate::datasource::Labels;
use crate::db::MuteFilter;

/// Id of the first active mute whose filter matches, if any
pub fn matching_mute(
    filters: &[MuteFilter],
    ident: &str,
    classpaths: &[String],
    tags: &Labels,
    now: i64,
) -> Option<i64> {
    filters
        .iter()
        .filter(|f| f.is_active(now))
        .find(|f| {
            f.classpath_matches(classpaths.iter().map(String::as_str))
                && f.ident_matches(ident)
                && f.tags_match(tags)
        })
        .map(|f| f.mute_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MuteFilterSpec;

    fn filter(id: i64, prefix: &str, regex: &str, tags: &[(&str, &str)]) -> MuteFilter {
        MuteFilter::compile(
            id,
            MuteFilterSpec {
                classpath_prefix: prefix.to_string(),
                ident_regex: regex.to_string(),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            0,
            0,
        )
        .unwrap()
    }

    fn tags(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_all_three_parts_required() {
        let filters = vec![filter(1, "prod/", "^h.*$", &[("env", "prod")])];
        let cps = vec!["prod/web".to_string()];
        let env = tags(&[("env", "prod"), ("ident", "h1")]);

        assert_eq!(matching_mute(&filters, "h1", &cps, &env, 0), Some(1));
        assert_eq!(matching_mute(&filters, "db1", &cps, &env, 0), None);
        assert_eq!(matching_mute(&filters, "h1", &["staging/web".to_string()], &env, 0), None);
        assert_eq!(matching_mute(&filters, "h1", &cps, &tags(&[("env", "dev")]), 0), None);
    }

    #[test]
    fn test_missing_resource_data_fails_open() {
        let filters = vec![filter(1, "prod/", "", &[])];
        assert_eq!(matching_mute(&filters, "h1", &[], &Labels::new(), 0), None);
    }

    #[test]
    fn test_any_filter_mutes() {
        let filters = vec![filter(1, "", "^nope$", &[]), filter(2, "", "^h1$", &[])];
        assert_eq!(matching_mute(&filters, "h1", &[], &Labels::new(), 0), Some(2));
    }

    #[test]
    fn test_inactive_window_ignored() {
        let mut f = filter(1, "", "", &[]);
        f.btime = 100;
        f.etime = 200;
        assert_eq!(matching_mute(&[f.clone()], "h1", &[], &Labels::new(), 50), None);
        assert_eq!(matching_mute(&[f], "h1", &[], &Labels::new(), 150), Some(1));
    }
}
