pub mod customer;
pub mod device;
pub mod employee;
pub mod notification;
pub mod notification_type;
pub mod order;
pub mod outbox_event;
pub mod plan;
pub mod processed_payment;
pub mod product;

pub use customer::{Entity as Customer, Model as CustomerModel};
pub use device::{Entity as Device, Model as DeviceModel};
pub use employee::{Entity as Employee, Model as EmployeeModel};
pub use notification::{Entity as Notification, Model as NotificationModel};
pub use notification_type::{Entity as NotificationType, Model as NotificationTypeModel};
pub use order::{Entity as Order, Model as OrderModel};
pub use outbox_event::{Entity as OutboxEvent, Model as OutboxEventModel};
pub use plan::{Entity as Plan, Model as PlanModel};
pub use processed_payment::{Entity as ProcessedPayment, Model as ProcessedPaymentModel};
pub use product::{Entity as Product, Model as ProductModel};
