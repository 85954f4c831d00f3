//! Property tests for identifiers and assignment helpers.

use chrono::{NaiveDate, NaiveTime};
use proptest::prelude::*;

use koa_dep::models::Koaid;
use koa_dep::services::program_assigner::{meets_majority, observer_names, Window};

fn any_date() -> impl Strategy<Value = NaiveDate> {
    (1995i32..2040, 1u32..=12, 1u32..=28)
        .prop_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn any_time() -> impl Strategy<Value = NaiveTime> {
    (0u32..86_400, 0u32..100).prop_map(|(secs, hundredths)| {
        NaiveTime::from_num_seconds_from_midnight_opt(secs, hundredths * 10_000_000).unwrap()
    })
}

proptest! {
    #[test]
    fn prop_koaid_text_round_trips(date in any_date(), utc in any_time()) {
        let koaid = Koaid::new("HI", date, utc).unwrap();
        let text = koaid.to_string();
        prop_assert_eq!(text.len(), 20);
        prop_assert_eq!(text.parse::<Koaid>().unwrap(), koaid.clone());
        prop_assert_eq!(koaid.date(), date);
    }

    #[test]
    fn prop_distinct_hundredths_give_distinct_koaids(
        date in any_date(),
        a in any_time(),
        b in any_time(),
    ) {
        let ka = Koaid::new("KB", date, a).unwrap();
        let kb = Koaid::new("KB", date, b).unwrap();
        prop_assert_eq!(a == b, ka == kb);
        prop_assert_eq!(a < b, ka < kb);
    }

    #[test]
    fn prop_observer_names_are_clean(raw in "[A-Za-z ,./&()-]{0,40}") {
        let names = observer_names(&raw);
        for name in &names {
            prop_assert!(name.chars().count() > 1);
            prop_assert_eq!(name.clone(), name.to_lowercase());
            prop_assert!(!name.contains(','));
        }
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        prop_assert_eq!(deduped.len(), names.len());
    }

    #[test]
    fn prop_majority_needs_a_share_above_threshold(count in 0usize..200, extra in 0usize..200) {
        let total = count + extra;
        if meets_majority(count, total) {
            prop_assert!(count > 3);
            prop_assert!(count as f64 / total as f64 > 0.85);
        }
        if total > 0 && extra == 0 && count > 3 {
            prop_assert!(meets_majority(count, total));
        }
    }

    #[test]
    fn prop_adjacent_windows_partition_the_night(
        start in 0u32..24, split in 1u32..10, len in 1u32..10, at in 0u32..86_400,
    ) {
        let hour = |h: u32| NaiveTime::from_hms_opt(h % 24, 0, 0).unwrap();
        let first = Window::new(hour(start), hour(start + split));
        let second = Window::new(hour(start + split), hour(start + split + len));
        let t = NaiveTime::from_num_seconds_from_midnight_opt(at, 0).unwrap();
        prop_assert!(!(first.contains(t) && second.contains(t)));
    }
}
