//! Process-level configuration read from environment variables.

/// Default maximum nesting depth of messages and groups.
pub const DEFAULT_RECURSION_LIMIT: u32 = 100;

/// Interpret a string value such as "1" or "no" as a boolean.
pub fn str_as_bool(s: &str) -> bool {
    match s {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => {
            log::warn!("Unrecognized boolean value \"{}\"", s);
            false
        }
    }
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
pub fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .as_ref()
        .map(|s| str_as_bool(s))
        .unwrap_or(default)
}

/// Read a non-negative integer from an environment variable.
pub fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(s) => s.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid value \"{}\" for {}", s, name);
            default
        }),
        Err(_) => default,
    }
}

/// Return whether compiled programs should be logged.
///
/// Controlled by `TDPB_DUMP_PROGRAMS`. Programs are logged at trace level.
pub fn dump_programs() -> bool {
    env_flag("TDPB_DUMP_PROGRAMS", false)
}

/// Return the default recursion limit for decoding.
///
/// Controlled by `TDPB_RECURSION_LIMIT`.
pub fn default_recursion_limit() -> u32 {
    env_u32("TDPB_RECURSION_LIMIT", DEFAULT_RECURSION_LIMIT)
}

#[cfg(test)]
mod tests {
    use tdpb_testing::TestCases;

    use super::str_as_bool;

    #[test]
    fn test_str_as_bool() {
        #[derive(Debug)]
        struct Case {
            value: &'static str,
            expected: bool,
        }

        let cases = [
            Case { value: "1", expected: true },
            Case { value: "yes", expected: true },
            Case { value: "t", expected: true },
            Case { value: "0", expected: false },
            Case { value: "no", expected: false },
            Case { value: "maybe", expected: false },
        ];

        cases.test_each(|case| {
            assert_eq!(str_as_bool(case.value), case.expected);
        })
    }
}
