fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Falls back to idempotent default values when git is unavailable.
    vergen::EmitBuilder::builder()
        .git_sha(true)
        .git_branch()
        .emit()?;

    Ok(())
}
