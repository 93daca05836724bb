#![deny(clippy::all)]

use anyhow::Context;
use ardlk::{
    AstNode, ExecutionState, Interpreter, InterpreterOptions,
    SyncDataProvider,
};
use serde::Deserialize;
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    process,
};
use structopt::StructOpt;

/// The sub-command to execute.
#[derive(Debug, StructOpt)]
enum Command {
    /// Decode a CompactAST file and dump its tree.
    #[structopt(name = "decode")]
    Decode {
        /// Path to the .ast file
        #[structopt(parse(from_os_str), long = "ast", short = "a")]
        ast_path: PathBuf,
    },

    /// Decode and execute a CompactAST file, printing the command stream
    /// as JSON lines.
    #[structopt(name = "run")]
    Run {
        /// Path to the .ast file
        #[structopt(parse(from_os_str), long = "ast", short = "a")]
        ast_path: PathBuf,
        /// Path to the interpreter options file, in JSON format. If not
        /// provided, defaults are used.
        #[structopt(parse(from_os_str), long = "options")]
        options_path: Option<PathBuf>,
        /// Path to the canned provider responses file, in JSON format. If
        /// not provided, every read answers 0.
        #[structopt(parse(from_os_str), long = "responses")]
        responses_path: Option<PathBuf>,
        /// Suppress the command stream (state and stats still print).
        #[structopt(long = "quiet", short = "q")]
        quiet: bool,
    },
}

/// ardlk executable, for decoding and running CompactAST programs
#[derive(Debug, StructOpt)]
#[structopt(name = "ardlk")]
struct Opt {
    #[structopt(subcommand)]
    cmd: Command,
}

/// One queue of canned responses. Popped front-first; an exhausted queue
/// repeats its last value.
#[derive(Debug)]
struct ResponseQueue<T: Copy> {
    queue: VecDeque<T>,
    last: T,
}

impl<T: Copy> ResponseQueue<T> {
    fn new(values: Vec<T>, default: T) -> Self {
        Self {
            queue: values.into_iter().collect(),
            last: default,
        }
    }

    fn next(&mut self) -> T {
        if let Some(value) = self.queue.pop_front() {
            self.last = value;
        }
        self.last
    }
}

/// The canned-response file format: one queue per request kind.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponseScript {
    analog: Vec<i32>,
    digital: Vec<i32>,
    millis: Vec<u32>,
    micros: Vec<u32>,
    pulse: Vec<u32>,
    sensor: Vec<i32>,
}

/// A [SyncDataProvider] that answers from the canned queues, so a run is
/// fully reproducible — the headless-validator deployment.
struct ScriptedProvider {
    analog: ResponseQueue<i32>,
    digital: ResponseQueue<i32>,
    millis: ResponseQueue<u32>,
    micros: ResponseQueue<u32>,
    pulse: ResponseQueue<u32>,
    sensor: ResponseQueue<i32>,
}

impl From<ResponseScript> for ScriptedProvider {
    fn from(script: ResponseScript) -> Self {
        Self {
            analog: ResponseQueue::new(script.analog, 0),
            digital: ResponseQueue::new(script.digital, 0),
            millis: ResponseQueue::new(script.millis, 0),
            micros: ResponseQueue::new(script.micros, 0),
            pulse: ResponseQueue::new(script.pulse, 0),
            sensor: ResponseQueue::new(script.sensor, 0),
        }
    }
}

impl SyncDataProvider for ScriptedProvider {
    fn analog_read(&mut self, _pin: i32) -> i32 {
        self.analog.next()
    }

    fn digital_read(&mut self, _pin: i32) -> i32 {
        self.digital.next()
    }

    fn millis(&mut self) -> u32 {
        self.millis.next()
    }

    fn micros(&mut self) -> u32 {
        self.micros.next()
    }

    fn pulse_in(&mut self, _pin: i32, _state: i32, _timeout_us: u32) -> u32 {
        self.pulse.next()
    }

    fn library_sensor(
        &mut self,
        _library: &str,
        _method: &str,
        _arg: i32,
    ) -> i32 {
        self.sensor.next()
    }
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read file {:?}", path))
}

/// Loads a JSON config file. If the path is None, returns the default
/// value instead.
fn load_json<T: Default + serde::de::DeserializeOwned>(
    path_opt: &Option<PathBuf>,
) -> anyhow::Result<T> {
    match path_opt {
        None => Ok(T::default()),
        Some(path) => {
            let bytes = read_file(path)?;
            Ok(serde_json::from_slice(&bytes)?)
        }
    }
}

fn dump_node(node: &AstNode, depth: usize) {
    let mut line = format!("{}{:?}", "  ".repeat(depth), node.tag);
    if let Some(name) = &node.name {
        line.push_str(&format!(" name={}", name));
    }
    if let Some(type_name) = &node.type_name {
        line.push_str(&format!(" type={}", type_name));
    }
    if let Some(value) = &node.value {
        line.push_str(&format!(" value={:?}", value));
    }
    if let Some(op) = node.op {
        line.push_str(&format!(" op={:?}", op));
    }
    println!("{}", line);
    for c in &node.children {
        dump_node(c, depth + 1);
    }
}

fn run(opt: Opt) -> anyhow::Result<()> {
    match opt.cmd {
        // Decode and dump the tree
        Command::Decode { ast_path } => {
            let bytes = read_file(&ast_path)?;
            let root = ardlk::decode(&bytes)?;
            dump_node(&root, 0);
        }

        // Decode and execute
        Command::Run {
            ast_path,
            options_path,
            responses_path,
            quiet,
        } => {
            let bytes = read_file(&ast_path)?;
            let options: InterpreterOptions = load_json(&options_path)?;
            let script: ResponseScript = load_json(&responses_path)?;

            let mut interpreter = Interpreter::new(&bytes, options)?;
            interpreter.set_sync_data_provider(Box::new(
                ScriptedProvider::from(script),
            ));
            if !quiet {
                interpreter.set_command_callback(Box::new(|cmd| {
                    println!("{}", cmd.to_json());
                }));
            }

            interpreter.start();

            let stats = interpreter.stats();
            eprintln!(
                "State: {:?}\nCommands: {}\nLoop iterations: {}",
                interpreter.state(),
                stats.commands_emitted,
                stats.loop_iterations,
            );
            if interpreter.state() == ExecutionState::Error {
                if let Some(error) = interpreter.error() {
                    anyhow::bail!("execution failed: {}", error);
                }
            }
        }
    }
    Ok(())
}

fn main() {
    let exit_code = match run(Opt::from_args()) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("{:#}", err);
            1
        }
    };
    process::exit(exit_code);
}
