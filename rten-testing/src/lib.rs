//! Internal testing utilities for rten-decode.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Runs a table of test cases, collecting failures instead of stopping at
/// the first one.
///
/// Create a `Debug` struct conventionally named `Case`, build an array of
/// them named `cases` and call `cases.test_each(|case| { ... })`. Every case
/// runs. If any panicked, `test_each` panics afterwards with the number of
/// failures and their debug representations.
///
/// ```
/// use rten_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     prompt_len: usize,
///     steps: usize,
///     expected_len: usize,
/// }
///
/// let cases = [
///     Case { prompt_len: 4, steps: 2, expected_len: 6 },
///     Case { prompt_len: 1, steps: 0, expected_len: 1 },
/// ];
///
/// cases.test_each(|case| {
///     assert_eq!(case.prompt_len + case.steps, case.expected_len);
/// });
/// ```
///
/// Cases and captured values must be unwind safe. Build values with interior
/// mutability (eg. queues or buffers) inside the test function rather than
/// storing them in the case.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call `test` with a reference to each case, catching panics.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes each case
    /// by value. The debug representation is captured before the call.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn report_failures(failures: &[String]) {
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
        let failures: Vec<String> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .map(|case| format!("{:?}", case))
            .collect();
        report_failures(&failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let case_str = format!("{:?}", case);
            let test = &test;
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push(case_str);
            }
        }
        report_failures(&failures);
    }
}

/// Generate `len` scores uniformly distributed in `[-scale, scale)`.
///
/// Scores are rounded to a coarse grid so that randomized tests also
/// exercise exact ties.
pub fn random_scores(rng: &mut fastrand::Rng, len: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|_| {
            let x = (rng.f32() * 2.0 - 1.0) * scale;
            (x * 8.0).round() / 8.0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{random_scores, TestCases};

    #[test]
    fn test_test_cases_success() {
        #[derive(Clone, Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.clone().test_each(|case| _ = case.x);
        cases.test_each_value(|case| _ = case.x);
    }

    #[test]
    #[should_panic(expected = "2 test cases failed")]
    fn test_test_each_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        [Case { x: 1 }, Case { x: 2 }].test_each(|case| {
            _ = case.x;
            panic!("oh no");
        })
    }

    #[test]
    #[should_panic(expected = "1 test cases failed")]
    fn test_test_each_value_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        [Case { x: 1 }, Case { x: 2 }].test_each_value(|case| {
            assert_eq!(case.x, 1);
        })
    }

    #[test]
    fn test_random_scores() {
        let mut rng = fastrand::Rng::with_seed(42);
        let scores = random_scores(&mut rng, 256, 4.0);
        assert_eq!(scores.len(), 256);
        assert!(scores.iter().all(|x| (-4.0..=4.0).contains(x)));
        assert!(scores.iter().all(|x| (x * 8.0).fract() == 0.0));

        let mut rng = fastrand::Rng::with_seed(42);
        assert_eq!(random_scores(&mut rng, 256, 4.0), scores);
    }
}
