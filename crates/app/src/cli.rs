use clap::Parser;
use vision::ClassifyCliArgs;

/// Classify a live camera stream and print the top label.
///
/// While running, type `help` for the interactive commands.
#[derive(Debug, Parser)]
#[command(name = "live-classify", version)]
pub struct Cli {
    #[command(flatten)]
    pub args: ClassifyCliArgs,
    /// Print every presentation event as a JSON line.
    #[arg(long = "json", action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Print the label when it changes.
    Text,
    Json,
}

impl Cli {
    pub fn output(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_selects_json_output() {
        let cli = Cli::try_parse_from(["live-classify", "--json", "--threads", "1"]).unwrap();
        assert_eq!(cli.output(), OutputMode::Json);
        assert_eq!(cli.args.threads, Some(1));

        let cli = Cli::try_parse_from(["live-classify"]).unwrap();
        assert_eq!(cli.output(), OutputMode::Text);
    }
}
