use allocation_sampler::{AllocationSampler, SamplingAllocator, StackPrinter};

#[global_allocator]
static ALLOCATOR: SamplingAllocator = SamplingAllocator::new();

#[inline(never)]
fn foo() -> Vec<String> {
    (0..500).map(|i| format!("item-{i}")).collect()
}

fn main() {
    env_logger::init();

    let sampler = AllocationSampler::builder()
        .interval(10)
        .hook(&ALLOCATOR)
        .build()
        .unwrap();

    sampler.enable().unwrap();
    let items = foo();
    sampler.disable().unwrap();

    println!("{} items, {} allocations observed", items.len(), sampler.allocation_count());

    let mut printer = StackPrinter::new(std::io::stdout(), 4).unwrap();
    for location in sampler.heaviest_locations().unwrap().iter().take(3) {
        println!(
            "\n{} samples of {} at {}:{}",
            location.count, location.type_name, location.file, location.line
        );
        printer.show(&location.call_stack).unwrap();
    }

    let path = std::env::current_dir().unwrap().join("simple-allocation-report.json");
    sampler.report().unwrap().write_json(&path).unwrap();
    println!("\nReport saved to {}", path.display());
}
