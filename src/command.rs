#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Write a value to a register (tag id, value).
    WriteRegister(String, String),
    /// Zero the named running average.
    ResetAverage(String),
    /// Poll the device now instead of waiting for the next tick.
    Refresh,
}

impl Command {
    pub fn to_result_topic(&self) -> String {
        use Command::*;

        let rest = match self {
            WriteRegister(tag, _) => format!("set/{}", tag),
            ResetAverage(key) => format!("reset_average/{}", key),
            Refresh => "refresh".to_string(),
        };

        format!("result/{}", rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_topics() {
        assert_eq!(
            Command::WriteRegister("SP".to_string(), "21".to_string()).to_result_topic(),
            "result/set/SP"
        );
        assert_eq!(
            Command::ResetAverage("flue_avg".to_string()).to_result_topic(),
            "result/reset_average/flue_avg"
        );
        assert_eq!(Command::Refresh.to_result_topic(), "result/refresh");
    }
}
