//! Questions the migrator needs a human to answer.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAnswer {
    Yes,
    No,
    Skip,
}

impl fmt::Display for UiAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UiAnswer::Yes => "yes",
            UiAnswer::No => "no",
            UiAnswer::Skip => "skip",
        })
    }
}

/// Answers migration questions on the thread that owns the migrator.
pub trait UiDelegate {
    /// Ask a question that can be answered with yes or no.
    fn question_yes_no(&mut self, text: &str) -> UiAnswer;

    /// Ask a question that can also be skipped.
    fn question_yes_no_skip(&mut self, text: &str) -> UiAnswer;
}

/// Delegate giving the same answer to every question.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub UiAnswer);

impl UiDelegate for FixedAnswer {
    fn question_yes_no(&mut self, _text: &str) -> UiAnswer {
        match self.0 {
            UiAnswer::Skip => UiAnswer::No,
            answer => answer,
        }
    }

    fn question_yes_no_skip(&mut self, _text: &str) -> UiAnswer {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_answer_never_skips_yes_no_questions() {
        let mut ui = FixedAnswer(UiAnswer::Skip);
        assert_eq!(ui.question_yes_no("overwrite?"), UiAnswer::No);
        assert_eq!(ui.question_yes_no_skip("overwrite?"), UiAnswer::Skip);
    }
}
