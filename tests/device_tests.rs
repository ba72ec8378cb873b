//! Device Context Tests
//!
//! Tests for:
//! - Construction from settings, including invalid settings and heap failures
//! - Descriptor allocation and deferred release through the device queue
//! - Identity destruction evicting cached binding objects
//! - Shutdown releasing every native object

use std::sync::Arc;

use ember::allocator::DescriptorHeapKind;
use ember::backend::{BackendType, HeadlessBackend};
use ember::binding_cache::{BindingAttribs, BoundBuffer, LayoutElement, PipelineInputLayout, ValueType, VertexStream};
use ember::device::DeviceContext;
use ember::errors::EmberError;
use ember::identity::ResourceClass;
use ember::reclamation::QueueMask;
use ember::settings::DeviceSettings;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_settings() -> DeviceSettings {
    DeviceSettings {
        cpu_heap_size: [64, 16, 8, 8],
        gpu_static_size: [32, 8],
        gpu_dynamic_size: [32, 8],
        dynamic_chunk_size: [8, 4],
        command_queue_family: 0,
    }
}

fn device() -> (Arc<HeadlessBackend>, DeviceContext) {
    init_logging();
    let backend = Arc::new(HeadlessBackend::new(BackendType::Direct3D12));
    let device = DeviceContext::new(backend.clone(), small_settings()).unwrap();
    (backend, device)
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn construction_creates_only_the_shader_visible_heaps() {
    let (backend, device) = device();
    assert_eq!(device.backend_type(), BackendType::Direct3D12);
    assert_eq!(backend.live_heap_count(), 2);
    assert_eq!(backend.live_command_pool_count(), 1);
    assert_eq!(backend.live_binding_object_count(), 1);

    let resource_view = device.gpu_descriptor_heap(DescriptorHeapKind::ResourceView).unwrap();
    let desc = backend.heap_desc(resource_view.heap()).unwrap();
    assert!(desc.shader_visible);
    assert_eq!(desc.capacity, 64);

    assert!(device.gpu_descriptor_heap(DescriptorHeapKind::RenderTarget).is_none());
    assert!(device.gpu_descriptor_heap(DescriptorHeapKind::DepthStencil).is_none());
}

#[test]
fn invalid_settings_are_rejected() {
    init_logging();
    let backend = Arc::new(HeadlessBackend::default());
    let mut settings = small_settings();
    settings.dynamic_chunk_size[0] = 64;

    let result = DeviceContext::new(backend.clone(), settings);
    assert!(matches!(result, Err(EmberError::InvalidSettings(_))));
    assert_eq!(backend.live_heap_count(), 0);
}

#[test]
fn heap_creation_failure_leaves_nothing_behind() {
    init_logging();
    let backend = Arc::new(HeadlessBackend::default());
    backend.fail_next_heap_creations(1);

    let result = DeviceContext::new(backend.clone(), small_settings());
    assert!(matches!(result, Err(EmberError::OutOfHostMemory { .. })));
    assert_eq!(backend.live_heap_count(), 0);
    assert_eq!(backend.live_command_pool_count(), 0);
}

#[test]
fn settings_load_from_json() {
    let settings = DeviceSettings::from_json_str(r#"{ "gpu_static_size": [128, 16] }"#).unwrap();
    assert_eq!(settings.gpu_static_size, [128, 16]);
    assert_eq!(settings.cpu_heap_size, DeviceSettings::default().cpu_heap_size);

    let err = DeviceSettings::from_json_str(r#"{ "cpu_heap_size": [0, 1, 1, 1] }"#).unwrap_err();
    assert!(matches!(err, EmberError::InvalidSettings(_)));
}

// ============================================================================
// Descriptors
// ============================================================================

#[test]
fn released_descriptors_return_after_purge() {
    let (_backend, device) = device();
    let heap = device.gpu_descriptor_heap(DescriptorHeapKind::Sampler).unwrap();

    let all = device.allocate_gpu_descriptors(DescriptorHeapKind::Sampler, 8).unwrap();
    assert!(matches!(
        device.allocate_gpu_descriptors(DescriptorHeapKind::Sampler, 1),
        Err(EmberError::DescriptorHeapExhausted { .. })
    ));

    device.release_descriptors(all, QueueMask::queue(0) | QueueMask::queue(1));
    assert_eq!(device.purge(QueueMask::queue(0)), 0);
    assert_eq!(heap.static_partition().stats().allocated_slots, 8);
    assert_eq!(device.purge(QueueMask::queue(0) | QueueMask::queue(1)), 1);
    assert_eq!(heap.static_partition().stats().allocated_slots, 0);

    let again = device.allocate_gpu_descriptors(DescriptorHeapKind::Sampler, 8).unwrap();
    device.release_descriptors(again, QueueMask::NONE);
}

#[test]
fn cpu_heaps_grow_past_their_pool_size() {
    let (backend, device) = device();
    let first = device.allocate_cpu_descriptors(DescriptorHeapKind::RenderTarget, 8).unwrap();
    let second = device.allocate_cpu_descriptors(DescriptorHeapKind::RenderTarget, 8).unwrap();
    assert_ne!(first.heap(), second.heap());
    assert_eq!(device.cpu_descriptor_heap(DescriptorHeapKind::RenderTarget).pool_count(), 2);
    assert_eq!(backend.live_heap_count(), 4);

    device.release_descriptors(first, QueueMask::queue(0));
    device.release_descriptors(second, QueueMask::queue(0));
    assert_eq!(device.release_queue().pending_count(), 2);
}

#[test]
fn dynamic_allocators_use_the_configured_chunk_size() {
    let (_backend, device) = device();
    let mut ring = device.create_dynamic_allocator(DescriptorHeapKind::ResourceView, "frame");
    let allocation = ring.allocate(3).unwrap();
    assert!(allocation.offset >= 32);
    let heap = device.gpu_descriptor_heap(DescriptorHeapKind::ResourceView).unwrap();
    assert_eq!(heap.dynamic_partition().stats().allocated_slots, 8);

    ring.release_all(device.release_queue(), QueueMask::queue(0));
    device.purge(QueueMask::ALL);
    assert_eq!(heap.dynamic_partition().stats().allocated_slots, 0);
}

#[test]
#[should_panic(expected = "never shader-visible")]
fn depth_stencil_has_no_gpu_heap() {
    let (_backend, device) = device();
    let _ = device.allocate_gpu_descriptors(DescriptorHeapKind::DepthStencil, 1);
}

// ============================================================================
// Identities
// ============================================================================

#[test]
fn destroying_an_identity_evicts_cached_binding_objects() {
    let (backend, device) = device();
    let pipeline = device.create_identity(ResourceClass::Pipeline);
    let vertices = BoundBuffer {
        identity: device.create_identity(ResourceClass::Buffer),
        native: ember::backend::NativeHandle::from_raw(0xBEEF),
    };
    let layout = PipelineInputLayout::packed(pipeline, vec![LayoutElement::new(0, 0, 3, ValueType::Float32)]);
    let streams = [VertexStream::new(vertices, 0)];
    let attribs = BindingAttribs {
        layout: &layout,
        vertex_streams: &streams,
        index_buffer: None,
    };

    let object = device.binding_cache().get(&attribs).unwrap();
    assert!(backend.binding_object_desc(object).is_some());

    device.destroy_identity(vertices.identity);
    assert!(device.binding_cache().is_empty());
    assert!(backend.binding_object_desc(object).is_none());
    assert!(!device.identities().is_alive(vertices.identity));
    assert_eq!(device.identities().class_of(pipeline), Some(ResourceClass::Pipeline));
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn shutdown_releases_every_native_object() {
    let (backend, device) = device();

    let pipeline = device.create_identity(ResourceClass::Pipeline);
    let layout = PipelineInputLayout::packed(pipeline, vec![LayoutElement::new(0, 0, 4, ValueType::Uint8)]);
    let buffer = BoundBuffer {
        identity: device.create_identity(ResourceClass::Buffer),
        native: ember::backend::NativeHandle::from_raw(7),
    };
    device
        .binding_cache()
        .get(&BindingAttribs {
            layout: &layout,
            vertex_streams: &[VertexStream::new(buffer, 0)],
            index_buffer: None,
        })
        .unwrap();

    let descriptors = device.allocate_cpu_descriptors(DescriptorHeapKind::ResourceView, 4).unwrap();
    device.release_descriptors(descriptors, QueueMask::queue(3));

    let commands = device.command_pool().get().unwrap();
    device
        .command_pool()
        .recycle_deferred(commands, device.release_queue(), QueueMask::queue(3));

    drop(device);
    assert_eq!(backend.live_heap_count(), 0);
    assert_eq!(backend.live_binding_object_count(), 0);
    assert_eq!(backend.live_command_pool_count(), 0);
    assert_eq!(backend.live_command_buffer_count(), 0);
}
