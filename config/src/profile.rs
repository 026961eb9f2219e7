use serde::{
    Deserialize,
    Serialize,
};
use std::collections::HashMap;
use strum::{
    Display,
    EnumIter,
    EnumString,
};

/// Named preset of capture toggles and retention windows. Chosen once per run.
#[derive(Debug, Default, Clone, Copy, Display, EnumIter, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CollectionProfile {
    #[strum(to_string = "light")]
    #[serde(rename = "light")]
    Light,
    #[default]
    #[strum(to_string = "standard")]
    #[serde(rename = "standard")]
    Standard,
    #[strum(to_string = "standard+jstack")]
    #[serde(rename = "standard+jstack")]
    StandardJstack,
    #[strum(to_string = "health-check")]
    #[serde(rename = "health-check")]
    HealthCheck,
    #[strum(to_string = "waf")]
    #[serde(rename = "waf")]
    Waf,
}

/// Values a profile fixes for every capture toggle and retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileDefaults {
    pub logs_num_days: u64,
    pub queries_json_num_days: u64,
    pub collect_jfr: bool,
    pub jfr_time_seconds: u64,
    pub collect_jstack: bool,
    pub jstack_time_seconds: u64,
    pub collect_ttop: bool,
    pub ttop_time_seconds: u64,
    pub capture_heap_dump: bool,
    pub collect_system_tables_export: bool,
    pub collect_wlm: bool,
    pub collect_kvstore_report: bool,
    pub number_job_profiles: u64,
    pub system_tables_row_limit: u64,
    pub min_free_space_gb: u64,
}

impl CollectionProfile {
    pub fn defaults(&self) -> ProfileDefaults {
        match self {
            CollectionProfile::Light => ProfileDefaults {
                logs_num_days: 2,
                queries_json_num_days: 2,
                collect_jfr: false,
                jfr_time_seconds: 0,
                collect_jstack: false,
                jstack_time_seconds: 0,
                collect_ttop: false,
                ttop_time_seconds: 0,
                capture_heap_dump: false,
                collect_system_tables_export: true,
                collect_wlm: true,
                collect_kvstore_report: true,
                number_job_profiles: 10,
                system_tables_row_limit: 10_000,
                min_free_space_gb: 5,
            },
            CollectionProfile::Standard => ProfileDefaults {
                logs_num_days: 7,
                queries_json_num_days: 28,
                collect_jfr: true,
                jfr_time_seconds: 60,
                collect_jstack: false,
                jstack_time_seconds: 60,
                collect_ttop: true,
                ttop_time_seconds: 60,
                capture_heap_dump: false,
                collect_system_tables_export: true,
                collect_wlm: true,
                collect_kvstore_report: true,
                number_job_profiles: 20,
                system_tables_row_limit: 100_000,
                min_free_space_gb: 25,
            },
            CollectionProfile::StandardJstack => ProfileDefaults {
                collect_jstack: true,
                ..CollectionProfile::Standard.defaults()
            },
            CollectionProfile::HealthCheck => ProfileDefaults {
                logs_num_days: 7,
                queries_json_num_days: 28,
                collect_jfr: true,
                jfr_time_seconds: 300,
                collect_jstack: true,
                jstack_time_seconds: 300,
                collect_ttop: true,
                ttop_time_seconds: 300,
                capture_heap_dump: false,
                collect_system_tables_export: true,
                collect_wlm: true,
                collect_kvstore_report: true,
                number_job_profiles: 10_000,
                system_tables_row_limit: 500_000,
                min_free_space_gb: 40,
            },
            CollectionProfile::Waf => ProfileDefaults {
                logs_num_days: 7,
                queries_json_num_days: 28,
                collect_jfr: false,
                jfr_time_seconds: 0,
                collect_jstack: false,
                jstack_time_seconds: 0,
                collect_ttop: false,
                ttop_time_seconds: 0,
                capture_heap_dump: false,
                collect_system_tables_export: true,
                collect_wlm: true,
                collect_kvstore_report: true,
                number_job_profiles: 10_000,
                system_tables_row_limit: 500_000,
                min_free_space_gb: 25,
            },
        }
    }
}

impl config::Source for CollectionProfile {
    fn clone_into_box(&self) -> Box<dyn config::Source + Send + Sync> {
        Box::new(*self)
    }

    fn collect(&self) -> Result<config::Map<String, config::Value>, config::ConfigError> {
        let d = self.defaults();
        let mut cache = HashMap::<String, config::Value>::new();
        let mut set = |key: &str, value: config::Value| {
            cache.insert(key.to_string(), value);
        };
        set("collect", self.to_string().into());
        set("dremio-logs-num-days", d.logs_num_days.into());
        set("dremio-queries-json-num-days", d.queries_json_num_days.into());
        set("collect-jfr", d.collect_jfr.into());
        set("dremio-jfr-time-seconds", d.jfr_time_seconds.into());
        set("collect-jstack", d.collect_jstack.into());
        set("dremio-jstack-time-seconds", d.jstack_time_seconds.into());
        set("collect-ttop", d.collect_ttop.into());
        set("dremio-ttop-time-seconds", d.ttop_time_seconds.into());
        set("capture-heap-dump", d.capture_heap_dump.into());
        set("collect-system-tables-export", d.collect_system_tables_export.into());
        set("collect-wlm", d.collect_wlm.into());
        set("collect-kvstore-report", d.collect_kvstore_report.into());
        set("number-job-profiles", d.number_job_profiles.into());
        set("system-tables-row-limit", d.system_tables_row_limit.into());
        set("min-free-space-gb", d.min_free_space_gb.into());
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;
    use strum::IntoEnumIterator as _;

    #[test]
    fn profile_names_round_trip() {
        for profile in CollectionProfile::iter() {
            let parsed = CollectionProfile::from_str(&profile.to_string()).unwrap();
            assert_eq!(parsed, profile);
        }
        assert_eq!(
            CollectionProfile::from_str("standard+jstack").unwrap(),
            CollectionProfile::StandardJstack
        );
        assert!(CollectionProfile::from_str("everything").is_err());
    }

    #[test]
    fn jstack_profile_only_differs_in_jstack() {
        let standard = CollectionProfile::Standard.defaults();
        let jstack = CollectionProfile::StandardJstack.defaults();
        assert!(jstack.collect_jstack);
        assert!(!standard.collect_jstack);
        assert_eq!(
            ProfileDefaults {
                collect_jstack: false,
                ..jstack
            },
            standard
        );
    }
}
