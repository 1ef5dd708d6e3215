use anyhow::Context;

fn main() -> anyhow::Result<()> {
    let code = lognexus::run().context("lognexus failed")?;
    std::process::exit(code);
}
