//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(LeaseError)` on parser failure or on
/// any key that is not among the listed fields.
///
/// Example:
/// ```no_run
/// let config = parsed_config!(config_str => ManagerConfig;
///                             sweep_interval_ms, refresh_interval_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::LeaseError> {
            let mut config: $config_type = Default::default();
            let config_str = match config_str {
                Some(s) => s,
                None => return Ok(config),
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // anything left in the table is not an expected key
            if let Some(key) = table.keys().next() {
                return Err($crate::LeaseError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::LeaseError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        tick_ms: u64,
        label: String,
        ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                tick_ms: 1000,
                label: "leadership".into(),
                ratio: 0.5,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), LeaseError> {
        let config = parsed_config!(None => TestConfig; tick_ms, label, ratio)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), LeaseError> {
        let config_str = Some("label = 'singular'");
        let config = parsed_config!(config_str => TestConfig; label, ratio)?;
        let ref_config = TestConfig {
            tick_ms: 1000,
            label: "singular".into(),
            ratio: 0.5,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("bogus = 999");
        assert!(parsed_config!(config_str => TestConfig; tick_ms).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("tick_ms = 'soon'");
        assert!(parsed_config!(config_str => TestConfig; tick_ms).is_err());
    }
}
