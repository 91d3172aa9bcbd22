/// Handshake signals between units

/// A registered signal carrying a value and a valid flag.
/// Consumers sample `valid` before reading `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Wire<T: Clone> {
  pub value: T,
  pub valid: bool,
}

impl<T: Clone> Wire<T> {
  pub fn new(value: T) -> Self {
    Self { value, valid: false }
  }

  /// Drive a value and raise valid.
  pub fn set(&mut self, value: T) {
    self.value = value;
    self.valid = true;
  }

  /// Drop valid, keeping the last value on the line.
  pub fn clear(&mut self) {
    self.valid = false;
  }

  /// Value if valid, otherwise `None`.
  pub fn take(&self) -> Option<T> {
    if self.valid {
      Some(self.value.clone())
    } else {
      None
    }
  }
}

impl<T: Clone + Default> Default for Wire<T> {
  fn default() -> Self {
    Self {
      value: T::default(),
      valid: false,
    }
  }
}
