//! Internal testing utilities for the tdpb crates.
//!
//! - [`TestCases`] runs table-driven tests.
//! - [`Wire`] builds encoded messages field by field.
//! - [`SchemaBuilder`] builds descriptor sets, so tests can declare the
//!   schemas they decode against without running `protoc`.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

mod schema;
mod wire;

pub use schema::{MessageBuilder, SchemaBuilder, encode_file_set};
pub use wire::Wire;

/// Utility for creating parametrized (aka. table-driven) tests.
///
/// To create a table driven test:
///
/// 1. Import the `TestCases` trait
/// 2. Create a struct, conventionally named `Case`, that contains the data
///    for a single test case. This struct must implement `Debug`.
/// 3. Create a collection of `Case` instances (eg. an array or Vec),
///    conventionally named `cases`.
/// 4. Call `cases.test_each`, passing the test function as a closure
///
/// `test_each` runs every case and catches panics. If any case panics,
/// `test_each` panics afterwards with the number of failures and the debug
/// representation of each failing case.
///
/// ## Example
///
/// ```
/// use tdpb_testing::{TestCases, Wire};
///
/// // Add #[test] attribute
/// fn test_varint_len() {
///   #[derive(Debug)]
///   struct Case {
///     value: u64,
///     expected_len: usize,
///   }
///
///   let cases = [
///     Case { value: 1, expected_len: 2 },
///     Case { value: 300, expected_len: 3 },
///   ];
///
///   cases.test_each(|&Case { value, expected_len }| {
///     assert_eq!(Wire::new().varint(1, value).finish().len(), expected_len);
///   });
/// }
/// # test_varint_len();
/// ```
///
/// ## Passing cases by reference vs. value
///
/// `test_each` passes the case by reference so that it can still print the
/// case if the test panics. Use `test_each_clone` or `test_each_value` when
/// an owned case is easier to work with.
///
/// ## Unwind safety
///
/// Test cases and the test function must be
/// [unwind safe](https://doc.rust-lang.org/std/panic/fn.catch_unwind.html).
/// Values with interior mutability, such as a `Profile`, should be created
/// inside the test function rather than stored in the case or captured. If
/// that is not possible, wrap them in
/// [`AssertUnwindSafe`](std::panic::AssertUnwindSafe).
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call test function `test` with each test case in `self`, catching any panics.
    ///
    /// After all cases have been evaluated, return if no panics occurred or
    /// panic with details of failing cases otherwise.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes a clone
    /// of each test case to the test function.
    fn test_each_clone(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes test cases
    /// to the test function by value.
    ///
    /// Each case is formatted before the test function runs, so that it can
    /// be reported if the test panics.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn report_failures<T: Debug>(failures: &[T]) {
    assert_eq!(
        failures.len(),
        0,
        "{} test cases failed: {:?}",
        failures.len(),
        failures
    );
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();
        report_failures(&failures);
    }

    fn test_each_clone(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Clone + Debug + UnwindSafe,
    {
        let test = &test;
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| {
                let value = case.clone();
                std::panic::catch_unwind(move || test(value)).is_err()
            })
            .collect();
        report_failures(&failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let test = &test;
        let mut failures = Vec::new();
        for case in self {
            let case_str = format!("{:?}", case);
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push(case_str);
            }
        }
        report_failures(&failures);
    }
}

#[cfg(test)]
mod tests {
    use super::TestCases;

    #[test]
    fn test_test_cases_success() {
        #[derive(Clone, Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.clone().test_each(|case| _ = case.x);
        cases.clone().test_each_clone(|case| _ = case.x);
        cases.clone().test_each_value(|case| _ = case.x);
    }

    #[test]
    #[should_panic(expected = "1 test cases failed")]
    fn test_test_each_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each(|case| {
            assert_eq!(case.x, 1);
        })
    }

    #[test]
    #[should_panic(expected = "2 test cases failed")]
    fn test_test_each_clone_failure() {
        #[derive(Clone, Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each_clone(|case| {
            _ = case.x;
            panic!("oh no");
        })
    }

    #[test]
    #[should_panic(expected = "2 test cases failed")]
    fn test_test_each_value_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each_value(|case| {
            _ = case.x;
            panic!("oh no");
        })
    }
}
