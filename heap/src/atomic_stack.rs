//! Lock-free intrusive LIFO stack.
//!
//! Nodes are owned elsewhere and carry their own link. Pushing is safe from
//! any number of threads. Popping assumes one consumer per stack at a time;
//! with a single consumer a node cannot be popped and re-pushed between the
//! consumer's head read and its CAS, so ABA cannot occur.

use std::{
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

/// A node that can be threaded through an [`AtomicStack`].
///
/// # Safety
///
/// `link` must always return the same field of `self`, and that field must
/// not be used for anything else while the node is linked.
pub unsafe trait Linked: Sized {
    fn link(&self) -> &AtomicPtr<Self>;
}

pub struct AtomicStack<T: Linked> {
    head: AtomicPtr<T>,
    _marker: PhantomData<*mut T>,
}

// SAFETY: the stack only moves pointers around; nodes are Send/Sync-checked
// by whoever hands them out
unsafe impl<T: Linked + Send + Sync> Send for AtomicStack<T> {}
// SAFETY: all access to the head goes through atomics
unsafe impl<T: Linked + Send + Sync> Sync for AtomicStack<T> {}

impl<T: Linked> AtomicStack<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Publishes `node` as the new head.
    ///
    /// # Safety
    ///
    /// `node` must be valid until it is popped again and must not currently
    /// be linked into any stack.
    pub unsafe fn push(&self, node: NonNull<T>) {
        // SAFETY: caller guarantees node is valid
        let link = unsafe { node.as_ref() }.link();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            link.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(new_head) => head = new_head,
            }
        }
    }

    /// Removes the current head. Must only be called by the stack's single
    /// consumer.
    pub fn pop(&self) -> Option<NonNull<T>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let node = NonNull::new(head)?;
            // SAFETY: linked nodes stay valid until popped, and only we pop
            let next = unsafe { node.as_ref() }.link().load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: node is ours now
                    unsafe { node.as_ref() }
                        .link()
                        .store(ptr::null_mut(), Ordering::Relaxed);
                    return Some(node);
                }
                Err(new_head) => head = new_head,
            }
        }
    }

    /// Detaches the whole chain at once. Safe against concurrent pushers;
    /// anything pushed afterwards starts a fresh chain.
    pub fn take_all(&self) -> Drain<T> {
        let head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        Drain {
            next: NonNull::new(head),
        }
    }

    /// Momentary observation, stale as soon as it returns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T: Linked> Default for AtomicStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> fmt::Debug for AtomicStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicStack")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

/// Iterator over a chain detached by [`AtomicStack::take_all`].
pub struct Drain<T: Linked> {
    next: Option<NonNull<T>>,
}

impl<T: Linked> Iterator for Drain<T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        // SAFETY: the chain was detached from the stack, we own every node
        let link = unsafe { node.as_ref() }.link();
        self.next = NonNull::new(link.swap(ptr::null_mut(), Ordering::Relaxed));
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{Arc, Barrier},
        thread,
    };

    #[derive(Debug)]
    struct Node {
        value: usize,
        next: AtomicPtr<Node>,
    }

    impl Node {
        fn new(value: usize) -> Box<Self> {
            Box::new(Self {
                value,
                next: AtomicPtr::new(ptr::null_mut()),
            })
        }
    }

    // SAFETY: `next` is used for nothing but linking
    unsafe impl Linked for Node {
        fn link(&self) -> &AtomicPtr<Self> {
            &self.next
        }
    }

    fn leak(value: usize) -> NonNull<Node> {
        NonNull::from(Box::leak(Node::new(value)))
    }

    /// # Safety
    /// node must come from `leak` and be unlinked
    unsafe fn reclaim(node: NonNull<Node>) -> usize {
        let boxed = unsafe { Box::from_raw(node.as_ptr()) };
        boxed.value
    }

    #[test]
    fn empty_stack_pops_none() {
        let stack = AtomicStack::<Node>::new();
        assert!(stack.is_empty());
        assert!(stack.pop().is_none());
        assert_eq!(stack.take_all().count(), 0);
    }

    #[test]
    fn pop_is_lifo() {
        let stack = AtomicStack::<Node>::new();
        for i in 0..4 {
            unsafe { stack.push(leak(i)) };
        }
        assert!(!stack.is_empty());

        let mut order = Vec::new();
        while let Some(node) = stack.pop() {
            order.push(unsafe { reclaim(node) });
        }
        assert_eq!(order, vec![3, 2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[test]
    fn popped_node_is_unlinked() {
        let stack = AtomicStack::<Node>::new();
        unsafe {
            stack.push(leak(1));
            stack.push(leak(2));
        }
        let top = stack.pop().unwrap();
        assert!(
            unsafe { top.as_ref() }.next.load(Ordering::Relaxed).is_null(),
            "popped node must not point into the stack"
        );
        unsafe { reclaim(top) };
        unsafe { reclaim(stack.pop().unwrap()) };
    }

    #[test]
    fn take_all_detaches_chain() {
        let stack = AtomicStack::<Node>::new();
        for i in 0..5 {
            unsafe { stack.push(leak(i)) };
        }
        let drained: Vec<_> = stack
            .take_all()
            .map(|node| unsafe { reclaim(node) })
            .collect();
        assert_eq!(drained, vec![4, 3, 2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_pushers_single_consumer() {
        let threads = 8usize;
        let per_thread = 1000usize;
        let stack = Arc::new(AtomicStack::<Node>::new());
        let start = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let stack = stack.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    for i in 0..per_thread {
                        unsafe { stack.push(leak(t * per_thread + i)) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("pusher panicked");
        }

        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            let value = unsafe { reclaim(node) };
            assert!(seen.insert(value), "value {value} popped twice");
        }
        assert_eq!(seen.len(), threads * per_thread, "lost pushes");
    }

    #[test]
    fn consumer_races_pushers() {
        let total = 4000usize;
        let stack = Arc::new(AtomicStack::<Node>::new());

        let producer = {
            let stack = stack.clone();
            thread::spawn(move || {
                for i in 0..total {
                    unsafe { stack.push(leak(i)) };
                }
            })
        };

        let mut seen = HashSet::new();
        while seen.len() < total {
            match stack.pop() {
                Some(node) => {
                    assert!(seen.insert(unsafe { reclaim(node) }));
                }
                None => thread::yield_now(),
            }
        }
        producer.join().expect("producer panicked");
        assert!(stack.pop().is_none());
    }
}
