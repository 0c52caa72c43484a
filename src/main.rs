use anyhow::Result;

fn main() -> Result<()> {
    modwright::cli::run()
}
