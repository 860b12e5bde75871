//! 同期プッシュストリーム
//!
//! セグメンタ → グルーパー → マッパー → 出力 を繋ぐ単一スレッドの通知基盤。
//! update() は購読者リストのスナップショットを取り、順番に最後まで呼び出す。
//! 通知中の購読・購読解除は次回の update() から反映される。

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// 購読者
pub trait Observer<T> {
    fn on_next(&mut self, value: &T);

    /// ストリーム終端
    fn on_complete(&mut self) {}
}

/// クロージャを購読者として扱うためのラッパー
struct FnObserver<F>(F);

impl<T, F: FnMut(&T)> Observer<T> for FnObserver<F> {
    fn on_next(&mut self, value: &T) {
        (self.0)(value)
    }
}

/// 通知順
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationOrder {
    /// 後から購読したものが先に呼ばれる（先頭に挿入）
    #[default]
    Lifo,
    /// 購読順
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Slot<T> = Rc<RefCell<dyn Observer<T>>>;

struct Registry<T> {
    next_id: u64,
    order: NotificationOrder,
    entries: Vec<(SubscriptionId, Slot<T>)>,
}

impl<T> Registry<T> {
    fn insert(&mut self, slot: Slot<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        match self.order {
            NotificationOrder::Lifo => self.entries.insert(0, (id, slot)),
            NotificationOrder::Fifo => self.entries.push((id, slot)),
        }
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<Slot<T>> {
        self.entries.iter().map(|(_, slot)| Rc::clone(slot)).collect()
    }
}

/// マルチキャストのサブジェクト
///
/// クローンは同じ購読者リストを共有するハンドルになる。
pub struct Subject<T> {
    registry: Rc<RefCell<Registry<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Rc::clone(&self.registry),
        }
    }
}

impl<T: 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Subject<T> {
    /// LIFO順のサブジェクトを作成
    pub fn new() -> Self {
        Self::with_order(NotificationOrder::Lifo)
    }

    pub fn with_order(order: NotificationOrder) -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                next_id: 0,
                order,
                entries: Vec::new(),
            })),
        }
    }

    pub fn order(&self) -> NotificationOrder {
        self.registry.borrow().order
    }

    /// クロージャを購読
    pub fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: FnMut(&T) + 'static,
    {
        self.subscribe_observer(FnObserver(callback))
    }

    /// Observer実装を購読
    pub fn subscribe_observer<O>(&self, observer: O) -> Subscription<T>
    where
        O: Observer<T> + 'static,
    {
        let slot: Slot<T> = Rc::new(RefCell::new(observer));
        let id = self.registry.borrow_mut().insert(slot);
        Subscription {
            id,
            registry: Rc::downgrade(&self.registry),
        }
    }

    /// 値を通知
    ///
    /// 購読者が同じ購読者自身へ再帰的に通知するとRefCellの二重借用でpanicする。
    pub fn update(&self, value: &T) {
        let snapshot = self.registry.borrow().snapshot();
        for slot in snapshot {
            slot.borrow_mut().on_next(value);
        }
    }

    /// 終端を通知
    pub fn complete(&self) {
        let snapshot = self.registry.borrow().snapshot();
        for slot in snapshot {
            slot.borrow_mut().on_complete();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.registry.borrow().entries.len()
    }
}

/// 購読解除ハンドル
///
/// dropしても購読は解除されない。解除は unsubscribe() で明示的に行う。
pub struct Subscription<T> {
    id: SubscriptionId,
    registry: Weak<RefCell<Registry<T>>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// 購読を解除。サブジェクトが既に破棄されていればfalse
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.borrow_mut().remove(self.id),
            None => false,
        }
    }
}
