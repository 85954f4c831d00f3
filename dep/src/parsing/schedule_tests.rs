#[cfg(test)]
mod tests {
    use crate::parsing::schedule::{parse_schedule_time, read_schedule, read_schedule_str};
    use crate::parsing::ParseError;
    use chrono::NaiveTime;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Tab separated lines with all columns
    #[test]
    fn test_parse_tab_separated() {
        let content = "2021-03-04\tjdoe\tkeck1\tCIT\tSmith\tC123\tSmith, Jones\t05:00\t10:00\tHIRES\t1\n\
                       2021-03-04\tjdoe\tkeck2\tUCB\tLee\tU045\tLee\t10:00\t15:00\tHIRES\t1\n";
        let programs = read_schedule_str(content);
        assert_eq!(programs.len(), 2);
        assert_eq!(programs[0].proj_code, "C123");
        assert_eq!(programs[0].observer, "Smith, Jones");
        assert_eq!(programs[0].start_time, NaiveTime::from_hms_opt(5, 0, 0));
        assert_eq!(programs[1].institution, "UCB");
        assert_eq!(programs[1].end_time, NaiveTime::from_hms_opt(15, 0, 0));
        assert_eq!(programs[1].tel_nr.as_deref(), Some("1"));
    }

    /// Legacy space separated lines without start/end columns
    #[test]
    fn test_parse_space_separated_missing_trailing_columns() {
        let content = "2004-06-01 oa acct CIT Smith C123 Smith";
        let programs = read_schedule_str(content);
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].proj_code, "C123");
        assert!(programs[0].start_time.is_none());
        assert!(programs[0].end_time.is_none());
        assert!(programs[0].instrument.is_none());
        assert!(programs[0].time_window().is_none());
    }

    /// A lone NONE program means nothing was scheduled
    #[test]
    fn test_single_none_program_is_empty() {
        let content = "2021-03-04\tjdoe\tNONE\tNONE\tNONE\tNONE\tNONE\tNONE\tNONE\tNONE\tNONE";
        assert!(read_schedule_str(content).is_empty());
    }

    #[test]
    fn test_schedule_time_values() {
        assert_eq!(parse_schedule_time("07:30"), NaiveTime::from_hms_opt(7, 30, 0));
        assert_eq!(parse_schedule_time("07:30:15"), NaiveTime::from_hms_opt(7, 30, 15));
        assert_eq!(parse_schedule_time("NONE"), None);
        assert_eq!(parse_schedule_time("later"), None);
    }

    #[test]
    fn test_read_schedule_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "2021-03-04\tjdoe\tkeck1\tCIT\tSmith\tC123\tSmith\t05:00\t10:00\tHIRES\t1").unwrap();
        let programs = read_schedule(file.path()).unwrap();
        assert_eq!(programs.len(), 1);
    }

    #[test]
    fn test_missing_schedule_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_schedule(&dir.path().join("dep_obtainHIRES.txt"));
        assert!(matches!(result, Err(ParseError::NotFound(_))));
    }
}
