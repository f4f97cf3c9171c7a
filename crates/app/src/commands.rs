//! Interactive control commands read from stdin while classifying.

use std::str::FromStr;

use ml_core::{DeviceConfig, ExecutionDevice, ModelVariant};

pub const HELP: &str = "\
commands:
  pause | resume      stop or restart capture and classification
  switch              move to the other camera lens
  cpu | gpu           run the classifier on the given device
  float | quantized   choose the model variant
  threads <N>         inference threads
  status              show engine, lens and counters
  quit                exit";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    SwitchLens,
    Device(ExecutionDevice),
    Model(ModelVariant),
    Threads(usize),
    Status,
    Help,
    Quit,
}

impl Command {
    /// Engine configuration this command asks for, starting from `current`.
    pub fn reconfigure(self, current: DeviceConfig) -> Option<DeviceConfig> {
        match self {
            Command::Device(device) => Some(current.with_device(device)),
            Command::Model(model) => Some(current.with_model(model)),
            Command::Threads(threads) => Some(current.with_threads(threads)),
            _ => None,
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_owned());
        };
        let command = match verb.to_ascii_lowercase().as_str() {
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "switch" => Command::SwitchLens,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            "threads" => {
                let count = words
                    .next()
                    .ok_or_else(|| "threads needs a count".to_owned())?;
                let count = count
                    .parse::<usize>()
                    .map_err(|_| format!("invalid thread count {count:?}"))?;
                Command::Threads(count)
            }
            other => match (other.parse::<ExecutionDevice>(), other.parse::<ModelVariant>()) {
                (Ok(device), _) => Command::Device(device),
                (_, Ok(model)) => Command::Model(model),
                _ => return Err(format!("unknown command {other:?}; try `help`")),
            },
        };

        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument {extra:?}"));
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        assert_eq!("pause".parse(), Ok(Command::Pause));
        assert_eq!(" Resume ".parse(), Ok(Command::Resume));
        assert_eq!("switch".parse(), Ok(Command::SwitchLens));
        assert_eq!("gpu".parse(), Ok(Command::Device(ExecutionDevice::Gpu)));
        assert_eq!("cpu".parse(), Ok(Command::Device(ExecutionDevice::Cpu)));
        assert_eq!("quantized".parse(), Ok(Command::Model(ModelVariant::Quantized)));
        assert_eq!("float".parse(), Ok(Command::Model(ModelVariant::Float)));
        assert_eq!("threads 4".parse(), Ok(Command::Threads(4)));
        assert_eq!("q".parse(), Ok(Command::Quit));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("".parse::<Command>().is_err());
        assert!("threads".parse::<Command>().is_err());
        assert!("threads many".parse::<Command>().is_err());
        assert!("pause now".parse::<Command>().is_err());
        assert!("zoom".parse::<Command>().is_err());
    }

    #[test]
    fn reconfigure_changes_one_field() {
        let current = DeviceConfig::default();
        assert_eq!(
            Command::Device(ExecutionDevice::Gpu).reconfigure(current),
            Some(DeviceConfig::new(ModelVariant::Float, ExecutionDevice::Gpu, 2))
        );
        assert_eq!(
            Command::Threads(0).reconfigure(current),
            Some(current.with_threads(0))
        );
        assert_eq!(Command::Pause.reconfigure(current), None);
    }
}
