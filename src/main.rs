fn main() {
    if let Err(err) = trivy_offline::cli::run() {
        trivy_offline::ui::eprintln_error(&err);
        std::process::exit(trivy_offline::exit::exit_code(&err));
    }
}
