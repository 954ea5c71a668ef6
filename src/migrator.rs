use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240901_000001_create_catalog_tables::Migration),
            Box::new(m20240901_000002_create_fulfillment_tables::Migration),
            Box::new(m20240901_000003_create_notification_tables::Migration),
            Box::new(m20240901_000004_create_account_tables::Migration),
        ]
    }
}

mod m20240901_000001_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240901_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Products::Title).string().not_null())
                        .col(ColumnDef::new(Products::Price).decimal().not_null())
                        .col(ColumnDef::new(Products::Description).text().not_null())
                        .col(ColumnDef::new(Products::ShortDescription).string().null())
                        .col(ColumnDef::new(Products::ImageKey).string().null())
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Plans::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Plans::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Plans::Name).string().not_null())
                        .col(ColumnDef::new(Plans::Price).decimal().not_null())
                        .col(ColumnDef::new(Plans::Description).text().not_null())
                        .col(ColumnDef::new(Plans::RefreshRate).integer().not_null())
                        .col(
                            ColumnDef::new(Plans::SharedUserQuota)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Plans::ImageKey).string().null())
                        .col(
                            ColumnDef::new(Plans::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Plans::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Title,
        Price,
        Description,
        ShortDescription,
        ImageKey,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Plans {
        Table,
        Id,
        Name,
        Price,
        Description,
        RefreshRate,
        SharedUserQuota,
        ImageKey,
        CreatedAt,
    }
}

mod m20240901_000002_create_fulfillment_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240901_000002_create_fulfillment_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Devices::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Devices::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Devices::PhoneNumber).string().not_null())
                        .col(ColumnDef::new(Devices::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Devices::OwnerId).string().null())
                        .col(ColumnDef::new(Devices::PlanId).uuid().null())
                        .col(ColumnDef::new(Devices::InvitedUsers).json().not_null())
                        .col(ColumnDef::new(Devices::Nickname).string().null())
                        .col(ColumnDef::new(Devices::InviteCode).string().not_null())
                        .col(ColumnDef::new(Devices::Latitude).double().null())
                        .col(ColumnDef::new(Devices::Longitude).double().null())
                        .col(
                            ColumnDef::new(Devices::SimulationStep)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Devices::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Devices::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_devices_invite_code")
                        .table(Devices::Table)
                        .col(Devices::InviteCode)
                        .unique()
                        .to_owned(),
                )
                .await?;

            // Stock lookup: unowned devices of a product, oldest first
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_devices_product_owner")
                        .table(Devices::Table)
                        .col(Devices::ProductId)
                        .col(Devices::OwnerId)
                        .col(Devices::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::UserId).string().not_null())
                        .col(ColumnDef::new(Orders::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Orders::DeviceId).uuid().not_null())
                        .col(ColumnDef::new(Orders::PlanId).uuid().not_null())
                        .col(
                            ColumnDef::new(Orders::Delivered)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::DeliveryDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::DeliveredAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Orders::DeliveryAddress).string().not_null())
                        .col(ColumnDef::new(Orders::PaymentId).string().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProcessedPayments::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProcessedPayments::Id)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProcessedPayments::ProcessedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProcessedPayments::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Devices::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Devices {
        Table,
        Id,
        PhoneNumber,
        ProductId,
        OwnerId,
        PlanId,
        InvitedUsers,
        Nickname,
        InviteCode,
        Latitude,
        Longitude,
        SimulationStep,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        UserId,
        ProductId,
        DeviceId,
        PlanId,
        Delivered,
        CreatedAt,
        DeliveryDate,
        DeliveredAt,
        DeliveryAddress,
        PaymentId,
    }

    #[derive(DeriveIden)]
    enum ProcessedPayments {
        Table,
        Id,
        ProcessedAt,
    }
}

mod m20240901_000003_create_notification_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240901_000003_create_notification_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(NotificationTypes::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(NotificationTypes::Id)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(NotificationTypes::Kind).string().not_null())
                        .col(
                            ColumnDef::new(NotificationTypes::MessageTemplate)
                                .text()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_notification_types_kind")
                        .table(NotificationTypes::Table)
                        .col(NotificationTypes::Kind)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Notifications::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Notifications::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Notifications::UserId).string().not_null())
                        .col(ColumnDef::new(Notifications::DeviceId).uuid().null())
                        .col(
                            ColumnDef::new(Notifications::NotificationTypeId)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Notifications::Message).text().not_null())
                        .col(
                            ColumnDef::new(Notifications::SentAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_notifications_user_id")
                        .table(Notifications::Table)
                        .col(Notifications::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OutboxEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OutboxEvents::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::AggregateType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OutboxEvents::AggregateId).uuid().null())
                        .col(ColumnDef::new(OutboxEvents::EventType).string().not_null())
                        .col(ColumnDef::new(OutboxEvents::Payload).text().not_null())
                        .col(
                            ColumnDef::new(OutboxEvents::Status)
                                .string_len(20)
                                .not_null()
                                .default("pending"),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::Attempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::AvailableAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(OutboxEvents::ErrorMessage).text().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_outbox_events_status_available")
                        .table(OutboxEvents::Table)
                        .col(OutboxEvents::Status)
                        .col(OutboxEvents::AvailableAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OutboxEvents::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Notifications::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(NotificationTypes::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum NotificationTypes {
        Table,
        Id,
        Kind,
        MessageTemplate,
    }

    #[derive(DeriveIden)]
    enum Notifications {
        Table,
        Id,
        UserId,
        DeviceId,
        NotificationTypeId,
        Message,
        SentAt,
    }

    #[derive(DeriveIden)]
    enum OutboxEvents {
        Table,
        Id,
        AggregateType,
        AggregateId,
        EventType,
        Payload,
        Status,
        Attempts,
        AvailableAt,
        CreatedAt,
        ProcessedAt,
        ErrorMessage,
    }
}

mod m20240901_000004_create_account_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240901_000004_create_account_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Employees::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Employees::Id)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Employees::Email).string().not_null())
                        .col(ColumnDef::new(Employees::Name).string().not_null())
                        .col(
                            ColumnDef::new(Employees::IsAdmin)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Employees::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_employees_email")
                        .table(Employees::Table)
                        .col(Employees::Email)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Customers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Customers::Id)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Customers::Email).string().null())
                        .col(ColumnDef::new(Customers::FirstName).string().null())
                        .col(ColumnDef::new(Customers::LastName).string().null())
                        .col(ColumnDef::new(Customers::Phone).string().null())
                        .col(
                            ColumnDef::new(Customers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Customers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Customers::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Employees::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Employees {
        Table,
        Id,
        Email,
        Name,
        IsAdmin,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Customers {
        Table,
        Id,
        Email,
        FirstName,
        LastName,
        Phone,
        CreatedAt,
        UpdatedAt,
    }
}
