//! Command-line argument utility.
//!
//! A thin decorator over clap's builder API: named flags, typed named
//! options with environment-variable override and default value, and
//! required/optional positional arguments. `parse` reports either a parse
//! error or a missing-required-arguments error listing every missing name;
//! typed values are retrieved with [`ArgumentParser::get`] after parsing.

use std::fmt::Display;
use std::str::FromStr;

use clap::builder::ValueParser;
use clap::{Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;

/// Errors produced by [`ArgumentParser`].
#[derive(Error, Debug)]
pub enum ArgumentError {
    #[error("unable to parse arguments: {0}")]
    Parse(String),

    #[error("the following required arguments are missing: {0:?}")]
    MissingRequired(Vec<String>),

    #[error("help requested:\n{0}")]
    HelpRequested(String),

    #[error("unknown or mistyped argument \"{0}\"")]
    Unknown(String),

    #[error("arguments have not been parsed yet")]
    NotParsed,
}

/// Builder-style argument parser.
///
/// Arguments are registered by name; the name is also the retrieval key.
pub struct ArgumentParser {
    command: Option<Command>,
    matches: Option<ArgMatches>,
    required: Vec<String>,
    num_positionals: usize,
}

fn parse_typed<T>(s: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    s.parse::<T>().map_err(|e| e.to_string())
}

impl ArgumentParser {
    pub fn new(name: &str, description: &str) -> Self {
        let command = Command::new(name.to_string())
            .about(description.to_string())
            .disable_version_flag(true);
        Self {
            command: Some(command),
            matches: None,
            required: Vec::new(),
            num_positionals: 0,
        }
    }

    fn push_arg(&mut self, arg: Arg) {
        // Command's builder methods consume self.
        let command = self.command.take().unwrap_or_else(|| Command::new("parser"));
        self.command = Some(command.arg(arg));
    }

    /// Adds a boolean flag, false unless given on the command line.
    pub fn add_flag(&mut self, name: &str, long: &str, description: &str) {
        let arg = Arg::new(name.to_string())
            .long(long.trim_start_matches('-').to_string())
            .help(description.to_string())
            .action(ArgAction::SetTrue);
        self.push_arg(arg);
    }

    /// Adds a typed named option with a default value and an optional
    /// environment-variable override (the variable applies when the option
    /// is absent from the command line).
    pub fn add_option<T>(
        &mut self,
        name: &str,
        long: &str,
        description: &str,
        default: T,
        env: Option<&'static str>,
    ) where
        T: Clone + Send + Sync + 'static + FromStr + ToString,
        T::Err: Display,
    {
        let mut arg = Arg::new(name.to_string())
            .long(long.trim_start_matches('-').to_string())
            .help(description.to_string())
            .value_parser(ValueParser::new(parse_typed::<T>))
            .default_value(default.to_string());
        if let Some(var) = env {
            arg = arg.env(var);
        }
        self.push_arg(arg);
    }

    /// Adds a required positional argument.
    ///
    /// Missing values are collected and reported together by [`parse`],
    /// rather than failing on the first one.
    ///
    /// [`parse`]: ArgumentParser::parse
    pub fn add_required_argument<T>(&mut self, name: &str, description: &str)
    where
        T: Clone + Send + Sync + 'static + FromStr,
        T::Err: Display,
    {
        self.num_positionals += 1;
        let arg = Arg::new(name.to_string())
            .help(description.to_string())
            .index(self.num_positionals)
            .required(false)
            .value_parser(ValueParser::new(parse_typed::<T>));
        self.required.push(name.to_string());
        self.push_arg(arg);
    }

    /// Adds an optional positional argument with a default.
    pub fn add_argument<T>(&mut self, name: &str, description: &str, default: T)
    where
        T: Clone + Send + Sync + 'static + FromStr + ToString,
        T::Err: Display,
    {
        self.num_positionals += 1;
        let arg = Arg::new(name.to_string())
            .help(description.to_string())
            .index(self.num_positionals)
            .required(false)
            .default_value(default.to_string())
            .value_parser(ValueParser::new(parse_typed::<T>));
        self.push_arg(arg);
    }

    /// Parses the process arguments.
    pub fn parse(&mut self) -> Result<(), ArgumentError> {
        self.parse_from(std::env::args())
    }

    /// Parses an explicit argument list (the first entry is the program
    /// name).
    pub fn parse_from<I, S>(&mut self, argv: I) -> Result<(), ArgumentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = self.command.clone().ok_or(ArgumentError::NotParsed)?;
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        let matches = command.try_get_matches_from(argv).map_err(|e| {
            use clap::error::ErrorKind;
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                    ArgumentError::HelpRequested(e.to_string())
                }
                _ => ArgumentError::Parse(e.to_string()),
            }
        })?;

        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|name| matches.get_raw(name).map(|mut v| v.next().is_none()).unwrap_or(true))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ArgumentError::MissingRequired(missing));
        }

        self.matches = Some(matches);
        Ok(())
    }

    /// True once `parse` has succeeded.
    pub fn parsed(&self) -> bool {
        self.matches.is_some()
    }

    /// Retrieves a typed value by name. Fails before `parse`.
    pub fn get<T>(&self, name: &str) -> Result<T, ArgumentError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let matches = self.matches.as_ref().ok_or(ArgumentError::NotParsed)?;
        matches
            .try_get_one::<T>(name)
            .map_err(|_| ArgumentError::Unknown(name.to_string()))?
            .cloned()
            .ok_or_else(|| ArgumentError::Unknown(name.to_string()))
    }

    /// Retrieves a flag's state.
    pub fn flag(&self, name: &str) -> Result<bool, ArgumentError> {
        self.get::<bool>(name)
    }

    /// Renders the help message.
    pub fn help(&self) -> String {
        match &self.command {
            Some(command) => command.clone().render_help().to_string(),
            None => String::new(),
        }
    }
}
