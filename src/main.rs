use anyhow::Result;
use muscat::correction::CorrectionRun;
use muscat::settings;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = settings::load_config()?;
    let mut run = CorrectionRun::new(settings)?;

    run.solve()?;
    run.writeup()
}
