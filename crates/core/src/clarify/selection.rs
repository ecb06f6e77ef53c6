use super::model::ClarificationQuestion;

/// In-progress picks for a multi-select question.
///
/// Individual toggles are independent; `toggle_all` selects every option
/// unless all are already selected, in which case it clears them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    values: Vec<String>,
    selected: Vec<bool>,
}

impl Selection {
    pub fn new(question: &ClarificationQuestion) -> Self {
        let values: Vec<String> = question.options.iter().map(|o| o.value.clone()).collect();
        let selected = vec![false; values.len()];
        Self { values, selected }
    }

    /// Flip one option; unknown values are ignored. Returns the new state.
    pub fn toggle_option(&mut self, value: &str) -> bool {
        match self.values.iter().position(|v| v == value) {
            Some(idx) => {
                self.selected[idx] = !self.selected[idx];
                self.selected[idx]
            }
            None => false,
        }
    }

    pub fn toggle_all(&mut self) {
        let target = !self.is_all_selected();
        self.selected.iter_mut().for_each(|s| *s = target);
    }

    pub fn is_selected(&self, value: &str) -> bool {
        self.values
            .iter()
            .position(|v| v == value)
            .is_some_and(|idx| self.selected[idx])
    }

    pub fn is_all_selected(&self) -> bool {
        !self.selected.is_empty() && self.selected.iter().all(|s| *s)
    }

    /// Selected option values in option order.
    pub fn values(&self) -> Vec<String> {
        self.values
            .iter()
            .zip(&self.selected)
            .filter(|(_, selected)| **selected)
            .map(|(value, _)| value.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        !self.selected.iter().any(|s| *s)
    }
}
