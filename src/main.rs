use stress_test::{stress_test_gcounter, stress_test_gset, stress_test_scaling};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())?;
    Ok(())
}

async fn async_main() -> mdcs_cluster::Result<()> {

    // Run cluster stress tests
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CLUSTER STRESS TESTS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: GSet with small scale
    let stats = stress_test_gset(4, 50, 100).await?;
    stats.print();

    // Test 2: GCounter with small scale
    let stats = stress_test_gcounter(4, 50, 100).await?;
    stats.print();

    // Test 3: GSet with medium scale
    let stats = stress_test_gset(10, 100, 500).await?;
    stats.print();

    // Test 4: GCounter with medium scale
    let stats = stress_test_gcounter(10, 100, 500).await?;
    stats.print();

    // Test 5: Scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS (GSet)                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(20, 4).await?;

    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
