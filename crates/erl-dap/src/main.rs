use clap::Parser;
use miette::miette;

fn main() -> miette::Result<()> {
    let settings = erl_dap::AdapterSettings::parse();
    erl_dap::start(settings).map_err(|e| miette!(e.to_string()))
}
