use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Result};

pub enum Command {
  /// Run N pipeline stages
  Step(u32),
  /// Print the current stage and cycle count
  Info,
  Quit,
  Continue,
}

/// Parse one shell line. `None` means the line was rejected and a message
/// was already printed.
pub fn parse_command(line: &str) -> Option<Command> {
  let trimmed = line.trim();

  if trimmed.is_empty() {
    return Some(Command::Step(1));
  }

  if let Some(rest) = trimmed.strip_prefix("si") {
    let num_str = rest.trim();
    if num_str.is_empty() {
      eprintln!("Error: 'si' requires a number, e.g., 'si 3'");
      return None;
    }
    return match num_str.parse::<u32>() {
      Ok(n) if n > 0 => Some(Command::Step(n)),
      Ok(_) => {
        eprintln!("Error: step count must be greater than 0");
        None
      },
      Err(e) => {
        eprintln!("Error: invalid number '{}': {}", num_str, e);
        None
      },
    };
  }

  match trimmed {
    "q" => Some(Command::Quit),
    "c" => Some(Command::Continue),
    "i" => Some(Command::Info),
    _ => {
      eprintln!(
        "Unknown command: '{}'. Use Enter to run one stage, 'si 3' to run N stages, 'i' for info, 'c' to continue, 'q' to quit",
        trimmed
      );
      None
    },
  }
}

pub struct Shell {
  editor: DefaultEditor,
}

impl Shell {
  pub fn new() -> Result<Self> {
    let editor = DefaultEditor::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(Self { editor })
  }

  pub fn read_command(&mut self) -> Result<Command> {
    loop {
      match self.editor.readline("(tinytpu) ") {
        Ok(line) => {
          let trimmed = line.trim();
          if !trimmed.is_empty() {
            let _ = self.editor.add_history_entry(trimmed);
          }
          if let Some(cmd) = parse_command(trimmed) {
            return Ok(cmd);
          }
        },
        // Ctrl-C / Ctrl-D
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(Command::Quit),
        Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
      }
    }
  }
}
