fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start async runtime");
    let exit_code = runtime.block_on(turborepo_lib::main());
    std::process::exit(exit_code);
}
