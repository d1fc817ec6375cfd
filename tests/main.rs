// Device-backed integration tests
//
// These need a working vulkan driver, so they are ignored by
// default. Run with `cargo test -- --ignored` on a machine with a
// GPU.

extern crate stratus;
use stratus::{
    AccessMask, AttachSize, AttachmentDesc, CreateInfo, Format, FormatFeatures, FormatOrder,
    FormatType, FuzzyFlags, ImageUsage, Inject, MemoryFlags, RecordInfo, Recorder, Reference,
    ShaderStage, Stratus,
};

fn init() -> Stratus {
    let info = CreateInfo::builder().name("stratus-test").build();
    Stratus::new(&info).expect("no vulkan device available")
}

fn color_format() -> Format {
    Format {
        ftype: FormatType::UNORM,
        order: FormatOrder::RGBA,
        comps: [8, 8, 8, 8],
    }
}

fn depth_format() -> Format {
    Format {
        ftype: FormatType::UNORM,
        order: FormatOrder::DEPTH,
        comps: [16, 0, 0, 0],
    }
}

struct NullRecorder;

impl Recorder for NullRecorder {
    fn record(&mut self, _info: &RecordInfo) {}
}

#[test]
#[ignore]
fn device_enumeration() {
    let engine = init();
    assert!(engine.get_num_devices() > 0);

    let dev = engine.get_primary_device();
    println!("primary device: {} ({:?})", dev.name(), dev.device_type());

    // Every real device samples plain rgba8.
    let support = dev.format_support(color_format());
    assert!(support.contains(FormatFeatures::SAMPLED_IMAGE));
}

#[test]
#[ignore]
fn format_fuzzy_on_device() {
    let engine = init();
    let dev = engine.get_primary_device();

    let query = Format {
        ftype: FormatType::UNORM,
        order: FormatOrder::RGBA,
        comps: [10, 10, 10, 10],
    };

    // Bounded from below, the result must be at least 10 bits deep.
    let fmt = dev.format_fuzzy(query, FuzzyFlags::MIN_DEPTH, FormatFeatures::SAMPLED_IMAGE);
    if !fmt.is_empty() {
        assert!(fmt.comps.iter().zip(query.comps.iter()).all(|(a, b)| a >= b));
    }

    // Bounded from above, at most 10 bits deep.
    let fmt = dev.format_fuzzy(query, FuzzyFlags::MAX_DEPTH, FormatFeatures::SAMPLED_IMAGE);
    assert!(!fmt.is_empty());
    assert!(fmt.comps.iter().zip(query.comps.iter()).all(|(a, b)| a <= b));
}

#[test]
#[ignore]
fn linear_chain_builds_and_rebuilds() {
    let engine = init();
    let dev = engine.get_primary_device();
    let mut renderer = engine.create_renderer(&dev, 2).unwrap();

    renderer
        .attach_image(
            0,
            AttachmentDesc {
                flags: MemoryFlags::empty(),
                usage: ImageUsage::SAMPLED,
                format: color_format(),
                size: AttachSize::Absolute(640, 480, 1),
            },
        )
        .unwrap();
    renderer
        .attach_image(
            1,
            AttachmentDesc {
                flags: MemoryFlags::empty(),
                usage: ImageUsage::empty(),
                format: depth_format(),
                size: AttachSize::Absolute(640, 480, 1),
            },
        )
        .unwrap();

    let a = renderer.add_pass(&[]).unwrap();
    let b = renderer.add_pass(&[a.clone()]).unwrap();
    let c = renderer.add_pass(&[b.clone()]).unwrap();

    for pass in [&a, &b, &c].iter() {
        pass.consume(
            0,
            AccessMask::ATTACHMENT_WRITE,
            ShaderStage::FRAGMENT,
        );
        pass.consume(
            1,
            AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE | AccessMask::DISCARD,
            ShaderStage::FRAGMENT,
        );
    }

    assert_eq!(renderer.num_sinks(), 1);
    renderer.build().unwrap();

    assert_eq!(a.order(), 0);
    assert_eq!(b.order(), 1);
    assert_eq!(c.order(), 2);
    let gens = [a.gen(), b.gen(), c.gen()];

    // An invalidated graph purges and rebuilds; the orders stay, the
    // generations move.
    renderer.invalidate();
    renderer.build().unwrap();
    assert_eq!(a.order(), 0);
    assert_eq!(b.order(), 1);
    assert_eq!(c.order(), 2);
    assert_eq!(a.gen(), gens[0] + 1);
    assert_eq!(b.gen(), gens[1] + 1);
    assert_eq!(c.gen(), gens[2] + 1);

    // And an image-only renderer can drive full frames.
    renderer.acquire().unwrap();
    renderer.submit(&mut NullRecorder, &[]).unwrap();
    renderer.wait().unwrap();
}

#[test]
#[ignore]
fn heap_write_with_dependencies() {
    let engine = init();
    let dev = engine.get_primary_device();
    let heap = engine.create_heap(&dev).unwrap();
    let dep = engine.create_dependency(&dev, 1);

    let buffer = heap
        .alloc_buffer(
            MemoryFlags::WRITE | MemoryFlags::DEVICE_LOCAL,
            stratus::BufferUsage::VERTEX,
            4096,
        )
        .unwrap();

    let data = vec![7u8; 1024];
    let dst = Reference::buffer(&buffer);

    // Write and hand the result off through the dependency.
    heap.write(
        &dst,
        &data,
        None,
        &[Inject::signal(&dep, AccessMask::empty(), ShaderStage::empty())],
    )
    .unwrap();

    // A second write over the same region waits on the first.
    heap.write(&dst, &data, None, &[Inject::wait(&dep)]).unwrap();

    heap.flush().unwrap();
    heap.free_buffer(&buffer);
}
